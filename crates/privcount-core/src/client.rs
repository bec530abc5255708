//! Client-side protocol driver shared by the data collector and share
//! keeper: the cookie handshake, the status exchange, and the reconnect
//! cycle with exponential backoff.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::node::now_epoch;
use crate::protocol::{handshake_password, new_cookie, Connection, Message};

/// Role-specific behavior plugged into the shared session driver.
pub trait ProtocolClient {
    /// The client's status report, sent in answer to every server STATUS.
    fn status(&mut self) -> Value;

    /// The server's own status report arrived.
    fn handle_server_status(&mut self, status: &Value);

    /// A START command. Return the result payload, or `None` to answer
    /// `START FAIL` (for example while a collection delay is enforced).
    fn do_start(&mut self, config: Value) -> Option<Value>;

    /// A STOP command. Return the result payload, or `None` on failure.
    fn do_stop(&mut self, config: Value) -> Option<Value>;
}

/// How a completed session ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionOutcome {
    /// The server asked us to check in again after this many seconds.
    CheckinAfter(u64),
}

/// Drive one connection to the tally server until it asks for a checkin.
pub async fn run_session<S, C>(stream: S, client: &mut C) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: ProtocolClient,
{
    let mut conn = Connection::new(stream);

    // the server initiates the handshake
    let server_cookie = match conn.read_message().await? {
        Message::Handshake1 { server_cookie } => server_cookie,
        other => {
            return Err(Error::Protocol(format!(
                "expected HANDSHAKE1, got {other:?}"
            )));
        }
    };
    let client_cookie = new_cookie();
    conn.send_message(&Message::Handshake2 {
        client_cookie,
        password: handshake_password(client_cookie, server_cookie),
    })
    .await?;
    match conn.read_message().await? {
        Message::Handshake3 { success: true } => conn.set_authenticated(),
        Message::Handshake3 { success: false } => {
            return Err(Error::Protocol("handshake rejected by server".into()));
        }
        other => {
            return Err(Error::Protocol(format!(
                "expected HANDSHAKE3, got {other:?}"
            )));
        }
    }

    let mut checkin_acknowledged: Option<u64> = None;
    loop {
        match conn.read_message().await? {
            Message::Status { time: _, status } => {
                client.handle_server_status(&status);
                let our_status = client.status();
                conn.send_message(&Message::Status {
                    time: now_epoch(),
                    status: our_status,
                })
                .await?;
            }
            Message::Start { config } => {
                let result = client.do_start(config);
                conn.send_message(&Message::StartResult(result)).await?;
            }
            Message::Stop { config } => {
                let result = client.do_stop(config);
                conn.send_message(&Message::StopResult(result)).await?;
            }
            Message::Checkin { period } => {
                conn.send_message(&Message::CheckinSuccess).await?;
                checkin_acknowledged = Some(period);
                // the server closes after our acknowledgement
                match conn.read_message().await {
                    Err(_) => {}
                    Ok(other) => {
                        tracing::debug!("message after checkin: {:?}", other);
                    }
                }
                break;
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message from server: {other:?}"
                )));
            }
        }
    }

    match checkin_acknowledged {
        Some(period) => Ok(SessionOutcome::CheckinAfter(period)),
        None => Err(Error::Protocol("session ended without checkin".into())),
    }
}

/// Initial reconnect delay, doubled on every consecutive failure.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Keep a client checked in with the tally server forever: connect, run a
/// session, sleep the checkin period, reconnect. Connection failures back
/// off exponentially and reset on the next successful session.
pub async fn run_client_loop<C, F, Fut>(
    server_address: String,
    mut client: C,
    mut refresh: F,
) -> Result<()>
where
    C: ProtocolClient,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut backoff = INITIAL_BACKOFF;
    loop {
        refresh().await;
        tracing::info!("checking in with TallyServer at {}", server_address);
        match TcpStream::connect(&server_address).await {
            Ok(stream) => match run_session(stream, &mut client).await {
                Ok(SessionOutcome::CheckinAfter(period)) => {
                    backoff = INITIAL_BACKOFF;
                    tracing::debug!("next checkin in {} seconds", period);
                    tokio::time::sleep(Duration::from_secs(period)).await;
                }
                Err(e) => {
                    tracing::warn!("session with tally server failed: {}", e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            },
            Err(e) => {
                tracing::warn!("cannot connect to {}: {}", server_address, e);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::password_matches;
    use serde_json::json;

    struct TestClient {
        started: bool,
        stopped: bool,
        server_statuses: usize,
    }

    impl ProtocolClient for TestClient {
        fn status(&mut self) -> Value {
            json!({"type": "ShareKeeper", "name": "sk-test", "state": "idle"})
        }

        fn handle_server_status(&mut self, _status: &Value) {
            self.server_statuses += 1;
        }

        fn do_start(&mut self, _config: Value) -> Option<Value> {
            self.started = true;
            Some(json!({}))
        }

        fn do_stop(&mut self, _config: Value) -> Option<Value> {
            self.stopped = true;
            Some(json!({"Counts": {}, "Config": {}}))
        }
    }

    async fn server_side(stream: tokio::io::DuplexStream) {
        let mut conn = Connection::new(stream);
        let server_cookie = new_cookie();
        conn.send_message(&Message::Handshake1 { server_cookie })
            .await
            .expect("send handshake1");
        let Message::Handshake2 {
            client_cookie,
            password,
        } = conn.read_message().await.expect("handshake2")
        else {
            panic!("expected HANDSHAKE2");
        };
        assert!(password_matches(
            password,
            handshake_password(client_cookie, server_cookie)
        ));
        conn.send_message(&Message::Handshake3 { success: true })
            .await
            .expect("send handshake3");
        conn.set_authenticated();

        conn.send_message(&Message::Status {
            time: now_epoch(),
            status: json!({"state": "idle"}),
        })
        .await
        .expect("send status");
        let Message::Status { .. } = conn.read_message().await.expect("client status") else {
            panic!("expected client STATUS");
        };

        conn.send_message(&Message::Start {
            config: json!({"counters": {}}),
        })
        .await
        .expect("send start");
        let Message::StartResult(Some(_)) = conn.read_message().await.expect("start result")
        else {
            panic!("expected START SUCCESS");
        };

        conn.send_message(&Message::Stop {
            config: json!({"send_counters": true}),
        })
        .await
        .expect("send stop");
        let Message::StopResult(Some(_)) = conn.read_message().await.expect("stop result") else {
            panic!("expected STOP SUCCESS");
        };

        conn.send_message(&Message::Checkin { period: 7 })
            .await
            .expect("send checkin");
        let Message::CheckinSuccess = conn.read_message().await.expect("checkin success") else {
            panic!("expected CHECKIN SUCCESS");
        };
        conn.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn session_runs_start_stop_checkin() {
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(server_side(server_stream));

        let mut client = TestClient {
            started: false,
            stopped: false,
            server_statuses: 0,
        };
        let outcome = run_session(client_stream, &mut client)
            .await
            .expect("session");
        assert_eq!(outcome, SessionOutcome::CheckinAfter(7));
        assert!(client.started);
        assert!(client.stopped);
        assert_eq!(client.server_statuses, 1);

        server.await.expect("server task");
    }
}
