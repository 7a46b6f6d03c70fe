// Minimal local listener for the OAuth redirect. Accepts exactly one code on
// /auth/callback, answers other paths with 404, and gives up after the
// absolute flow timeout.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

const FLOW_TIMEOUT_SECS: u64 = 300;

fn success_response() -> &'static str {
    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n\
    <html>\
    <body style='font-family: sans-serif; text-align: center; padding: 50px;'>\
    <h1>Authorization complete</h1>\
    <p>You may close this window and return to the terminal.</p>\
    </body>\
    </html>"
}

fn not_found_response() -> &'static str {
    "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\n\r\nnot found"
}

fn bad_request_response() -> &'static str {
    "HTTP/1.1 400 Bad Request\r\nContent-Type: text/plain\r\n\r\nauthorization failed"
}

enum CallbackOutcome {
    Code(String),
    WrongPath,
    Rejected(String),
}

async fn handle_connection(stream: &mut TcpStream, expected_state: &str) -> CallbackOutcome {
    let mut buffer = [0u8; 4096];
    let bytes_read = stream.read(&mut buffer).await.unwrap_or(0);
    let request = String::from_utf8_lossy(&buffer[..bytes_read]);

    let path = request.lines().next().and_then(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            Some(parts[1].to_string())
        } else {
            None
        }
    });

    let Some(path) = path else {
        let _ = stream.write_all(bad_request_response().as_bytes()).await;
        return CallbackOutcome::Rejected("malformed_http_request".to_string());
    };

    if !path.starts_with("/auth/callback") {
        let _ = stream.write_all(not_found_response().as_bytes()).await;
        return CallbackOutcome::WrongPath;
    }

    let parsed = Url::parse(&format!("http://localhost{}", path)).ok();
    let mut code = None;
    let mut state = None;
    if let Some(url) = parsed {
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "code" => code = Some(v.to_string()),
                "state" => state = Some(v.to_string()),
                _ => {}
            }
        }
    }

    match (code, state) {
        (Some(code), Some(state)) if state == expected_state => {
            let _ = stream.write_all(success_response().as_bytes()).await;
            let _ = stream.flush().await;
            CallbackOutcome::Code(code)
        }
        (Some(_), _) => {
            let _ = stream.write_all(bad_request_response().as_bytes()).await;
            CallbackOutcome::Rejected("oauth_state_mismatch".to_string())
        }
        (None, _) => {
            let _ = stream.write_all(bad_request_response().as_bytes()).await;
            CallbackOutcome::Rejected("missing_authorization_code".to_string())
        }
    }
}

// Blocks until the browser hits the callback with a valid state, or the
// 5-minute flow timeout elapses.
pub async fn wait_for_code(port: u16, expected_state: &str) -> Result<String, String> {
    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .map_err(|e| format!("failed_to_bind_callback_port {}: {}", port, e))?;
    tracing::info!("OAuth callback listener ready on 127.0.0.1:{}", port);

    let accept_loop = async {
        loop {
            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| format!("failed_to_accept_connection: {}", e))?;
            match handle_connection(&mut stream, expected_state).await {
                CallbackOutcome::Code(code) => return Ok(code),
                CallbackOutcome::WrongPath => continue,
                CallbackOutcome::Rejected(reason) => return Err(reason),
            }
        }
    };

    match tokio::time::timeout(
        std::time::Duration::from_secs(FLOW_TIMEOUT_SECS),
        accept_loop,
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err("oauth_callback_timeout_after_5_minutes".to_string()),
    }
}
