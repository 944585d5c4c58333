use feedscope::storage::azure::AzureTableClient;
use feedscope::storage::remote::{RemoteTableStore, TableClient, TableOperation};
use feedscope::storage::{ExtraValue, StoredEntity, TableStore};
use mockito::Matcher;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: String,
    stamp: i64,
}

impl StoredEntity for Note {
    fn row_key(&self) -> String {
        self.id.clone()
    }
}

fn client_for(server: &mockito::Server) -> AzureTableClient {
    let connection_string = format!(
        "DefaultEndpointsProtocol=http;AccountName=devaccount;AccountKey=a2V5;TableEndpoint={}",
        server.url()
    );
    AzureTableClient::from_connection_string(&connection_string).unwrap()
}

fn note_json(id: &str, stamp: i64, chunk: &str) -> String {
    format!(
        r#"{{
            "odata.etag": "W/\"datetime'2024-01-01T00%3A00%3A00Z'\"",
            "PartitionKey": "p",
            "RowKey": "{id}",
            "Timestamp": "2024-01-01T00:00:00Z",
            "isProto": false,
            "dataChunks@odata.type": "Edm.Int64",
            "dataChunks": "1",
            "dataChunk_0@odata.type": "Edm.Binary",
            "dataChunk_0": "{chunk}",
            "extra_stamp@odata.type": "Edm.Int64",
            "extra_stamp": "{stamp}"
        }}"#
    )
}

#[tokio::test]
async fn test_existing_table_is_not_an_error() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/Tables")
        .match_header("x-ms-version", "2019-02-02")
        .match_header("authorization", Matcher::Regex("^SharedKeyLite devaccount:".to_string()))
        .match_body(Matcher::PartialJsonString(r#"{"TableName":"notes"}"#.to_string()))
        .with_status(409)
        .with_body(r#"{"odata.error":{"code":"TableAlreadyExists"}}"#)
        .create_async()
        .await;

    let client = client_for(&server);
    client.create_table_if_not_exists("notes").await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_create_table_server_error_is_surfaced() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/Tables")
        .with_status(503)
        .with_body("busy")
        .create_async()
        .await;

    let client = client_for(&server);
    assert!(client.create_table_if_not_exists("notes").await.is_err());
}

#[tokio::test]
async fn test_store_get_decodes_chunked_entity() {
    let mut server = mockito::Server::new_async().await;
    let create = server
        .mock("POST", "/Tables")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let found = server
        .mock("GET", Matcher::Regex(r"^/notes\(PartitionKey='p',RowKey='n1'\)".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(note_json("n1", 5, "eyJpZCI6Im4xIiwic3RhbXAiOjV9"))
        .create_async()
        .await;
    let missing = server
        .mock("GET", Matcher::Regex(r"^/notes\(PartitionKey='p',RowKey='zz'\)".to_string()))
        .with_status(404)
        .create_async()
        .await;

    let store: RemoteTableStore<Note> = RemoteTableStore::new(Arc::new(client_for(&server)), "notes");
    let note = store.get("n1", "p").await.unwrap();
    assert_eq!(
        note,
        Some(Note {
            id: "n1".to_string(),
            stamp: 5
        })
    );
    assert_eq!(store.get("zz", "p").await.unwrap(), None);

    create.assert_async().await;
    found.assert_async().await;
    missing.assert_async().await;
}

#[tokio::test]
async fn test_query_follows_continuation() {
    let mut server = mockito::Server::new_async().await;
    let first = server
        .mock("GET", Matcher::Regex(r"^/notes\(\)".to_string()))
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("$top".to_string(), "3".to_string()),
            Matcher::UrlEncoded(
                "$filter".to_string(),
                "PartitionKey eq 'p' and (extra_stamp ge 5L)".to_string(),
            ),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("x-ms-continuation-NextPartitionKey", "1!4!cA--")
        .with_header("x-ms-continuation-NextRowKey", "1!4!bjM-")
        .with_body(format!(
            r#"{{"value":[{},{}]}}"#,
            note_json("n1", 5, "eyJpZCI6Im4xIiwic3RhbXAiOjV9"),
            note_json("n2", 6, "eyJpZCI6Im4yIiwic3RhbXAiOjZ9")
        ))
        .create_async()
        .await;
    let second = server
        .mock("GET", Matcher::Regex(r"^/notes\(\)".to_string()))
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("$top".to_string(), "1".to_string()),
            Matcher::UrlEncoded("NextPartitionKey".to_string(), "1!4!cA--".to_string()),
            Matcher::UrlEncoded("NextRowKey".to_string(), "1!4!bjM-".to_string()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"value":[{}]}}"#,
            note_json("n3", 7, "eyJpZCI6Im4zIiwic3RhbXAiOjd9")
        ))
        .create_async()
        .await;

    let client = client_for(&server);
    let records = client
        .query_entities("notes", Some("p"), Some("extra_stamp ge 5L"), Some(3))
        .await
        .unwrap();

    let keys: Vec<_> = records.iter().map(|r| r.row_key.as_str()).collect();
    assert_eq!(keys, vec!["n1", "n2", "n3"]);
    assert!(!records[0].fields.contains_key("Timestamp"));
    first.assert_async().await;
    second.assert_async().await;
}

#[tokio::test]
async fn test_batch_sends_changeset() {
    let mut server = mockito::Server::new_async().await;
    let _create = server
        .mock("POST", "/Tables")
        .with_status(201)
        .create_async()
        .await;
    let batch = server
        .mock("POST", Matcher::Regex(r"^/\$batch".to_string()))
        .match_header("content-type", Matcher::Regex("^multipart/mixed; boundary=batch_".to_string()))
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r"PUT \S+/notes\(PartitionKey='p',RowKey='n1'\) HTTP/1.1".to_string()),
            Matcher::Regex(r#""extra_stamp@odata.type":"Edm.Int64""#.to_string()),
            Matcher::Regex(r"DELETE \S+/notes\(PartitionKey='p',RowKey='old'\) HTTP/1.1".to_string()),
            Matcher::Regex(r"If-Match: \*".to_string()),
        ]))
        .with_status(202)
        .with_body("--batchresponse_1\r\nHTTP/1.1 204 No Content\r\n\r\n--batchresponse_1--\r\n")
        .create_async()
        .await;

    let client = client_for(&server);
    let note = Note {
        id: "n1".to_string(),
        stamp: 5,
    };
    let extra = vec![("stamp".to_string(), ExtraValue::Int(5))];
    let record = feedscope::storage::codec::encode_entity(&note, "p", "n1", Some(&extra)).unwrap();
    client
        .submit_transaction(
            "notes",
            "p",
            &[
                TableOperation::Upsert(record),
                TableOperation::Delete {
                    row_key: "old".to_string(),
                },
            ],
        )
        .await
        .unwrap();
    batch.assert_async().await;
}

#[tokio::test]
async fn test_rejected_batch_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    let _create = server
        .mock("POST", "/Tables")
        .with_status(409)
        .create_async()
        .await;
    let _batch = server
        .mock("POST", Matcher::Regex(r"^/\$batch".to_string()))
        .with_status(202)
        .with_body("--batchresponse_1\r\nHTTP/1.1 413 Request Entity Too Large\r\n\r\n--batchresponse_1--\r\n")
        .create_async()
        .await;

    let store: RemoteTableStore<Note> = RemoteTableStore::new(Arc::new(client_for(&server)), "notes");
    let note = Note {
        id: "n1".to_string(),
        stamp: 5,
    };
    let err = store.write(&note, "p", None).await.unwrap_err();
    assert!(err.to_string().contains("413"));
}
