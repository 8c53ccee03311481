use futures::StreamExt;
use serde_json::{json, Value};
use std::net::{SocketAddr, TcpListener};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use travel_connect::{
    api::{build_router, AppState},
    config::{Config, WeatherSettings},
};

async fn spawn_server() -> (SocketAddr, JoinHandle<()>, AppState, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    listener.set_nonblocking(true).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        bind: addr.to_string(),
        data_dir: tmp.path().to_path_buf(),
        max_upload_mb: 5,
        logging_enabled: false,
        weather: WeatherSettings {
            base_url: "http://127.0.0.1:9".into(),
            api_key: String::new(),
            api_host: String::new(),
        },
    };
    let state = AppState::new(config).await.unwrap();
    let app = build_router(state.clone());
    let server = tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    (addr, server, state, tmp)
}

async fn account(client: &reqwest::Client, addr: SocketAddr, first: &str, email: &str) -> String {
    client
        .post(format!("http://{}/api/register", addr))
        .json(&json!({
            "firstName": first, "lastName": "Test", "email": email,
            "password": "pw-123456", "confirmPassword": "pw-123456"
        }))
        .send()
        .await
        .unwrap();
    let resp: Value = client
        .post(format!("http://{}/api/login", addr))
        .json(&json!({"email": email, "password": "pw-123456"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    resp["token"].as_str().unwrap().to_string()
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("feed update in time")
        .unwrap()
        .unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

#[tokio::test]
async fn live_feed_pushes_growth_with_notification() {
    let (addr, server, _state, _tmp) = spawn_server().await;
    let client = reqwest::Client::new();
    let ada = account(&client, addr, "Ada", "ada@x.io").await;
    let bob = account(&client, addr, "Bob", "bob@x.io").await;
    let cleo = account(&client, addr, "Cleo", "cleo@x.io").await;

    let conv: Value = client
        .post(format!("http://{}/api/conversations", addr))
        .bearer_auth(&ada)
        .json(&json!({"memberEmails": ["bob@x.io"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let conv_id = conv["id"].as_str().unwrap().to_string();

    let mut req = format!("ws://{}/ws/conversations/{}", addr, conv_id)
        .into_client_request()
        .unwrap();
    req.headers_mut()
        .append("Authorization", format!("Bearer {}", bob).parse().unwrap());
    let (mut ws, _) = connect_async(req).await.unwrap();

    let snapshot = next_json(&mut ws).await;
    assert_eq!(snapshot["t"], "snapshot");
    assert_eq!(snapshot["messages"].as_array().unwrap().len(), 1);

    for text in ["first", "second"] {
        client
            .post(format!("http://{}/api/conversations/{}/messages", addr, conv_id))
            .bearer_auth(&ada)
            .json(&json!({ "text": text }))
            .send()
            .await
            .unwrap();
    }
    let update = next_json(&mut ws).await;
    assert_eq!(update["t"], "update");
    assert_eq!(update["messages"].as_array().unwrap().len(), 2);
    assert_eq!(update["notification"]["message_count"], 2);
    assert_eq!(update["notification"]["preview"], "first");
    let update = next_json(&mut ws).await;
    let texts: Vec<&str> = update["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, vec!["Conversation initiated", "first", "second"]);
    assert_eq!(update["notification"]["message_count"], 3);

    // outsiders cannot watch the feed
    let mut req = format!("ws://{}/ws/conversations/{}", addr, conv_id)
        .into_client_request()
        .unwrap();
    req.headers_mut()
        .append("Authorization", format!("Bearer {}", cleo).parse().unwrap());
    assert!(connect_async(req).await.is_err());

    server.abort();
}
