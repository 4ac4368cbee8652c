//! Session HTTP contre un backend scripté sur socket locale: une seule
//! ré-authentification sur TOKEN_EXPIRED avec rejeu de l'appel, et refus
//! applicatif d'un lot de lecturas.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use relaywatch_agent::backend::{BackendApi, HttpBackend};
use relaywatch_agent::error::AgentError;
use relaywatch_agent::models::ReadingRecord;
use relaywatch_agent::notify::Notifier;
use relaywatch_agent::AgentConfig;

#[derive(Debug, Clone)]
struct Seen {
    path: String,
    authorization: Option<String>,
}

fn response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn auth_ok(token: &str) -> String {
    response(
        "200 OK",
        &format!(
            r#"{{"exito":true,"token":"{token}","agente":{{"id":"a1","nombre":"Agente Norte"}},"workspaces":[]}}"#
        ),
    )
}

fn find_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

fn header_value(request: &str, name: &str) -> Option<String> {
    request.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.eq_ignore_ascii_case(name)
            .then(|| value.trim().to_string())
    })
}

/// Mini backend scripté: sert une réponse par connexion, dans l'ordre, et
/// journalise chemin + en-tête Authorization de chaque requête.
async fn spawn_backend(replies: Vec<String>) -> (String, Arc<Mutex<Vec<Seen>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);

    tokio::spawn(async move {
        for reply in replies {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            // lire l'en-tête complet puis le corps annoncé par Content-Length
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let mut body_start = None;
            let mut content_len = 0usize;
            loop {
                let read = match socket.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(_) => return,
                };
                buf.extend_from_slice(&chunk[..read]);
                if body_start.is_none() {
                    if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                        body_start = Some(pos + 4);
                        let head = String::from_utf8_lossy(&buf[..pos]).to_string();
                        content_len = header_value(&head, "content-length")
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                    }
                }
                if let Some(start) = body_start {
                    if buf.len() >= start + content_len {
                        break;
                    }
                }
            }
            let request = String::from_utf8_lossy(&buf).to_string();
            let path = request
                .lines()
                .next()
                .and_then(|l| l.split_whitespace().nth(1))
                .unwrap_or("")
                .to_string();
            log.lock().push(Seen {
                path,
                authorization: header_value(&request, "authorization"),
            });
            let _ = socket.write_all(reply.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), seen)
}

fn backend_for(url: String) -> HttpBackend {
    let (notifier, rx) = Notifier::channel();
    std::mem::forget(rx);
    let config = AgentConfig {
        backend_url: url,
        secret_key: "agt_test".into(),
        ..AgentConfig::default()
    };
    HttpBackend::new(&config, notifier)
}

#[tokio::test]
async fn expired_token_triggers_one_reauth_and_replay() {
    let (url, seen) = spawn_backend(vec![
        auth_ok("t1"),
        response("401 Unauthorized", r#"{"code":"TOKEN_EXPIRED"}"#),
        auth_ok("t2"),
        response("200 OK", r#"{"ok":true}"#),
    ])
    .await;
    let backend = backend_for(url);

    backend.authenticate().await.unwrap();
    backend.heartbeat().await.unwrap();

    let seen = seen.lock().clone();
    let paths: Vec<&str> = seen.iter().map(|s| s.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/api/agente/auth",
            "/api/agente/heartbeat",
            "/api/agente/auth",
            "/api/agente/heartbeat",
        ]
    );
    // le rejeu porte le jeton frais
    assert_eq!(seen[3].authorization.as_deref(), Some("Bearer t2"));
    assert_eq!(backend.session().unwrap().token, "t2");
}

#[tokio::test]
async fn second_expiry_is_not_retried_again() {
    let (url, seen) = spawn_backend(vec![
        auth_ok("t1"),
        response("401 Unauthorized", r#"{"code":"TOKEN_EXPIRED"}"#),
        auth_ok("t2"),
        response("401 Unauthorized", r#"{"code":"TOKEN_EXPIRED"}"#),
    ])
    .await;
    let backend = backend_for(url);

    backend.authenticate().await.unwrap();
    let err = backend.heartbeat().await.unwrap_err();
    assert!(matches!(err, AgentError::SessionExpired));
    // exactement un rejeu: auth, heartbeat, auth, heartbeat
    assert_eq!(seen.lock().len(), 4);
}

#[tokio::test]
async fn refused_readings_surface_as_backend_error() {
    let (url, _seen) = spawn_backend(vec![
        auth_ok("t1"),
        response("200 OK", r#"{"ok":false,"insertadas":0}"#),
    ])
    .await;
    let backend = backend_for(url);

    backend.authenticate().await.unwrap();
    let record = ReadingRecord::success("reg-1", vec![1, 2], 5);
    let err = backend.post_readings(&[record]).await.unwrap_err();
    assert!(matches!(err, AgentError::Backend(_)));
}
