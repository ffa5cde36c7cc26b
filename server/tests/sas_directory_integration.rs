use claims::{assert_err, assert_ok};
use server::auth::ConnectionStringInfo;
use server::broker::InMemoryBroker;
use server::common::ServiceBusError;
use server::model::EntityKind;
use server::operations::{
    ConnectionStringOperations, EntityDirectory, MessageTransport, SasDirectory,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const NAMESPACE: &str =
    "Endpoint=sb://demo.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=abc=";

#[derive(Debug, Clone)]
struct Recorded {
    target: String,
    authorization: Option<String>,
}

/// Local stand-in for a namespace's management endpoint.
///
/// Routes are keyed by path, or by `path#skip` for a specific page. Unknown
/// paths answer 404.
struct FakeNamespace {
    base_url: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeNamespace {
    async fn start(routes: Vec<(String, u16, String)>) -> Self {
        let routes: Arc<HashMap<String, (u16, String)>> = Arc::new(
            routes
                .into_iter()
                .map(|(key, status, body)| (key, (status, body)))
                .collect(),
        );
        let requests = Arc::new(Mutex::new(Vec::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let routes = routes.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 4096];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => head.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&head).to_string();
                    let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let authorization = head.lines().find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("authorization")
                            .then(|| value.trim().to_string())
                    });

                    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
                    let skip = query
                        .split('&')
                        .find_map(|pair| pair.strip_prefix("$skip="))
                        .unwrap_or("0");
                    let (status, body) = routes
                        .get(&format!("{path}#{skip}"))
                        .or_else(|| routes.get(path))
                        .cloned()
                        .unwrap_or((404, String::new()));
                    recorded.lock().unwrap().push(Recorded {
                        target: target.clone(),
                        authorization,
                    });

                    let reason = match status {
                        200 => "OK",
                        401 => "Unauthorized",
                        _ => "Not Found",
                    };
                    let response = format!(
                        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/atom+xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { base_url, requests }
    }

    fn directory(&self) -> SasDirectory {
        let info = ConnectionStringInfo::parse(NAMESPACE).unwrap();
        SasDirectory::from_connection_info(&info)
            .unwrap()
            .with_base_url(&self.base_url)
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

fn feed(entries: &[String]) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><feed xmlns="http://www.w3.org/2005/Atom"><title type="text">Entities</title>{}</feed>"#,
        entries.concat()
    )
}

fn entry(name: &str, description: &str, active: i64, sessions: bool) -> String {
    format!(
        r#"<entry><title type="text">{name}</title><content type="application/xml"><{description}><RequiresSession>{sessions}</RequiresSession><CountDetails xmlns:d2p1="http://schemas.microsoft.com/netservices/2011/06/servicebus"><d2p1:ActiveMessageCount>{active}</d2p1:ActiveMessageCount><d2p1:DeadLetterMessageCount>1</d2p1:DeadLetterMessageCount></CountDetails></{description}></content></entry>"#
    )
}

fn queue_entry(name: &str, active: i64, sessions: bool) -> String {
    entry(name, "QueueDescription", active, sessions)
}

#[tokio::test]
async fn queues_are_listed_with_a_signed_request() {
    let server = FakeNamespace::start(vec![(
        "/$Resources/Queues".to_string(),
        200,
        feed(&[queue_entry("orders", 7, false), queue_entry("checkout", 0, true)]),
    )])
    .await;

    let queues = assert_ok!(server.directory().list_queues().await);
    assert_eq!(queues.len(), 2);
    assert_eq!(queues[0].name, "orders");
    assert_eq!(queues[0].active_count, 7);
    assert_eq!(queues[0].dead_letter_count, 1);
    assert!(queues[1].requires_session);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].target.contains("api-version=2021-05"));
    let authorization = requests[0].authorization.as_deref().unwrap();
    assert!(authorization.starts_with(
        "SharedAccessSignature sr=https%3A%2F%2Fdemo.servicebus.windows.net%2F&sig="
    ));
    assert!(authorization.ends_with("&skn=root"));
}

#[tokio::test]
async fn full_pages_fetch_the_next_page() {
    let first: Vec<String> = (0..100)
        .map(|i| queue_entry(&format!("q{i:03}"), 0, false))
        .collect();
    let server = FakeNamespace::start(vec![
        ("/$Resources/Queues#0".to_string(), 200, feed(&first)),
        (
            "/$Resources/Queues#100".to_string(),
            200,
            feed(&[queue_entry("q100", 0, false)]),
        ),
    ])
    .await;

    let queues = assert_ok!(server.directory().list_queues().await);
    assert_eq!(queues.len(), 101);
    assert_eq!(queues[100].name, "q100");
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn subscriptions_keep_their_topic() {
    let server = FakeNamespace::start(vec![
        (
            "/events".to_string(),
            200,
            r#"<entry xmlns="http://www.w3.org/2005/Atom"><title type="text">events</title></entry>"#
                .to_string(),
        ),
        (
            "/events/Subscriptions".to_string(),
            200,
            feed(&[entry("audit", "SubscriptionDescription", 4, false)]),
        ),
    ])
    .await;

    let subscriptions = assert_ok!(server.directory().list_subscriptions("events").await);
    assert_eq!(subscriptions.len(), 1);
    assert_eq!(subscriptions[0].kind, EntityKind::Subscription);
    assert_eq!(subscriptions[0].parent_topic.as_deref(), Some("events"));
    assert_eq!(subscriptions[0].active_count, 4);
}

#[tokio::test]
async fn missing_topic_is_not_found() {
    let server = FakeNamespace::start(vec![("/ghost".to_string(), 200, feed(&[]))]).await;

    let err = assert_err!(server.directory().list_subscriptions("ghost").await);
    assert!(err.is_not_found());
}

#[tokio::test]
async fn empty_namespace_lists_nothing() {
    let server = FakeNamespace::start(vec![("/$Resources/Topics".to_string(), 200, feed(&[]))]).await;

    assert!(assert_ok!(server.directory().list_topics().await).is_empty());
}

#[tokio::test]
async fn rejected_key_fails_the_connection_check() {
    let server = FakeNamespace::start(vec![(
        "/$Resources/Queues".to_string(),
        401,
        "<Error><Code>401</Code></Error>".to_string(),
    )])
    .await;
    let ops = ConnectionStringOperations::new(NAMESPACE, Default::default())
        .unwrap()
        .with_backend(Arc::new(InMemoryBroker::new()))
        .with_directory(Arc::new(server.directory()));

    let err = assert_err!(ops.list_queues().await);
    assert!(matches!(err, ServiceBusError::Transport { .. }));

    let validation = ops.validate_connection().await;
    assert!(!validation.valid);
    assert!(validation.error.is_some());
}

#[tokio::test]
async fn accepted_key_passes_the_connection_check() {
    let server = FakeNamespace::start(vec![(
        "/$Resources/Queues".to_string(),
        200,
        feed(&[queue_entry("orders", 0, false)]),
    )])
    .await;
    let ops = ConnectionStringOperations::new(NAMESPACE, Default::default())
        .unwrap()
        .with_backend(Arc::new(InMemoryBroker::new()))
        .with_directory(Arc::new(server.directory()));

    let validation = ops.validate_connection().await;
    assert!(validation.valid);
    assert_eq!(validation.resolved_entity, None);
}
