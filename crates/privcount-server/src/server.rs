//! The tally server runtime: the listener, the per-connection protocol
//! driver, and the event-period refresh loop.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use privcount_core::delay::CollectionDelay;
use privcount_core::node::{continue_collecting, get_remaining_rounds, now_epoch};
use privcount_core::protocol::{
    handshake_password, new_cookie, password_matches, Connection, Message,
};

use crate::clients::{ClientRegistry, ClientStatus};
use crate::config::TallyServerConfig;
use crate::error::Result;
use crate::outcome;
use crate::round::CollectionRound;

/// The tally server's shared state: configuration, known clients, the
/// current round (if any), and the inter-round delay tracker.
pub struct TallyServer {
    config_path: PathBuf,
    pub config: TallyServerConfig,
    pub clients: ClientRegistry,
    pub round: Option<CollectionRound>,
    pub delay: CollectionDelay,
    num_completed_rounds: u64,
    idle_since: f64,
}

impl TallyServer {
    pub fn new(config_path: &Path) -> Result<Self> {
        let config = TallyServerConfig::load(config_path)?;
        Ok(TallyServer {
            config_path: config_path.to_path_buf(),
            config,
            clients: ClientRegistry::new(),
            round: None,
            delay: CollectionDelay::new(),
            num_completed_rounds: 0,
            idle_since: now_epoch(),
        })
    }

    /// Re-read the config; on failure keep the previous one.
    pub fn refresh_config(&mut self) {
        match TallyServerConfig::load(&self.config_path) {
            Ok(config) => self.config = config,
            Err(e) => tracing::warn!("problem reading config file: {}", e),
        }
    }

    pub fn checkin_period(&self) -> f64 {
        self.config.checkin_period
    }

    /// The server's own status report, sent in STATUS messages and recorded
    /// into outcome contexts.
    pub fn status(&self) -> Value {
        let dc_idle = self.clients.idle_dcs().len();
        let dc_active = self.clients.active_dcs().len();
        let sk_idle = self.clients.idle_sks().len();
        let sk_active = self.clients.active_sks().len();
        let mut status = json!({
            "state": if self.round.is_some() { "active" } else { "idle" },
            "time": self
                .round
                .as_ref()
                .and_then(CollectionRound::starting_ts)
                .unwrap_or(self.idle_since),
            "dcs_idle": dc_idle,
            "dcs_active": dc_active,
            "dcs_total": dc_idle + dc_active,
            "dcs_required": self.config.dc_threshold,
            "sks_idle": sk_idle,
            "sks_active": sk_active,
            "sks_total": sk_idle + sk_active,
            "sks_required": self.config.sk_threshold,
            "completed_phases": self.num_completed_rounds,
            "continue": serde_json::to_value(self.config.continue_policy)
                .unwrap_or(Value::Null),
            "delay_until": self.delay.get_next_round_start_time(
                &self.config.noise,
                self.config.delay_period,
                self.config.always_delay,
                self.config.sigma_decrease_tolerance,
            ),
        });
        if let Some(round) = &self.round {
            if let Some(starting_ts) = round.starting_ts() {
                status["expected_end_time"] = json!(starting_ts + self.config.collect_period);
            }
        }
        status
    }

    /// One event-period tick: refresh the config, sweep dead clients, and
    /// decide whether to start or stop a round.
    pub fn refresh(&mut self) {
        self.refresh_config();

        for uid in self.clients.clear_dead_clients(self.config.checkin_period) {
            if let Some(round) = &mut self.round {
                round.lost_client(&uid);
            }
        }

        match self.round.as_ref().map(|r| (r.is_error(), r.is_expired())) {
            None => {
                if continue_collecting(self.num_completed_rounds, self.config.continue_policy) {
                    self.try_start_round();
                }
            }
            Some((true, _)) => {
                tracing::info!("stopping collection round due to error");
                self.stop_round();
            }
            Some((false, true)) => {
                tracing::info!("stopping collection round due to valid expiration");
                self.stop_round();
            }
            Some((false, false)) => {}
        }

        self.log_status();
        if let Some(round) = &self.round {
            round.log_status();
        }
    }

    fn try_start_round(&mut self) {
        let dcs = self.clients.idle_dcs();
        let sks = self.clients.idle_sks();
        if dcs.len() < self.config.dc_threshold || sks.len() < self.config.sk_threshold {
            return;
        }
        if !self.delay.round_start_permitted(
            &self.config.noise,
            now_epoch(),
            self.config.delay_period,
            self.config.always_delay,
            self.config.sigma_decrease_tolerance,
        ) {
            return;
        }
        // every SK must have reported a public key before it can take shares
        let mut sk_public_keys = std::collections::BTreeMap::new();
        for uid in &sks {
            match self.clients.get(uid).and_then(|c| c.public_key.clone()) {
                Some(key) => {
                    sk_public_keys.insert(uid.clone(), key);
                }
                None => {
                    tracing::warn!("share keeper {} has not reported a public key", uid);
                    return;
                }
            }
        }
        tracing::info!(
            "starting collection round {} with {} DataCollectors and {} ShareKeepers",
            self.num_completed_rounds + 1,
            dcs.len(),
            sks.len()
        );
        let clock_padding = {
            let mut uids = dcs.clone();
            uids.extend(sks.iter().cloned());
            self.clients.clock_padding(&uids, self.config.checkin_period)
        };
        let mut round = CollectionRound::new(
            self.config.collect_period,
            self.config.counters.clone(),
            self.config.noise.clone(),
            self.config.noise_weight.clone(),
            self.config.dc_threshold,
            self.config.traffic_model.clone(),
            sks,
            sk_public_keys,
            dcs,
            clock_padding,
        );
        round.start();
        self.round = Some(round);
    }

    /// Drive the round toward stopped; once it stops, publish the outcome
    /// (successful rounds only) and record the stop with the delay tracker.
    fn stop_round(&mut self) {
        let Some(round) = &mut self.round else {
            return;
        };
        round.stop();
        if !round.is_stopped() {
            return;
        }
        // the end time is after all clients definitely stopped and answered,
        // not when the stop began: a lost message must not shorten the
        // enforced delay
        let end_time = now_epoch();
        let round = self
            .round
            .take()
            .unwrap_or_else(|| unreachable!("checked above"));
        self.num_completed_rounds += 1;

        if round.is_error() {
            tracing::warn!("round failed, no outcome file will be written");
        } else {
            let statuses = self.clients.snapshot();
            if let Err(e) = outcome::write_results(
                &round,
                &self.config.results,
                end_time,
                &statuses,
                self.status(),
                self.config.sanitized(),
            ) {
                tracing::warn!("could not write outcome: {}", e);
            }
        }
        if let Some(starting_ts) = round.starting_ts() {
            self.delay.set_stop_result(
                !round.is_error(),
                round.noise_config(),
                starting_ts,
                end_time,
                self.config.delay_period,
                self.config.always_delay,
                self.config.sigma_decrease_tolerance,
            );
        }
        self.idle_since = now_epoch();
    }

    /// Record a client's status report.
    pub fn set_client_status(&mut self, uid: &str, status: ClientStatus) {
        self.clients.set_client_status(uid, status);
    }

    /// The START payload owed to a client, if any.
    pub fn start_config_for(&self, uid: &str) -> Option<Value> {
        let round = self.round.as_ref()?;
        let config = round.start_config(uid)?;
        serde_json::to_value(config).ok()
    }

    /// The STOP payload owed to a client, if any. A client that thinks it is
    /// active while no round runs is stale and gets a cleanup stop.
    pub fn stop_config_for(&self, uid: &str) -> Option<Value> {
        match &self.round {
            Some(round) => {
                let config = round.stop_config(uid)?;
                serde_json::to_value(config).ok()
            }
            None => {
                let client = self.clients.get(uid)?;
                if client.state == "active" {
                    Some(json!({"send_counters": false}))
                } else {
                    None
                }
            }
        }
    }

    pub fn set_start_result(&mut self, uid: &str, result: Option<&Value>) {
        if let Some(round) = &mut self.round {
            match result {
                Some(data) => {
                    round.store_start_result(uid, data);
                }
                None => round.store_failure(uid),
            }
        }
    }

    pub fn set_stop_result(&mut self, uid: &str, result: Option<&Value>) {
        if let Some(round) = &mut self.round {
            match result {
                Some(data) => round.store_stop_result(uid, data),
                None => round.store_failure(uid),
            }
            // the final answer may complete the stop
            self.stop_round();
        }
    }

    /// A connection died; if its client was participating, fail the round.
    pub fn connection_lost(&mut self, uid: &str) {
        if let Some(round) = &mut self.round {
            if round.is_participating(uid) {
                round.lost_client(uid);
            }
        }
    }

    fn log_status(&self) {
        let status = self.status();
        tracing::info!(
            "server status: PrivCount is {} with {}/{} DCs and {}/{} SKs",
            status["state"].as_str().unwrap_or("unknown"),
            status["dcs_total"],
            status["dcs_required"],
            status["sks_total"],
            status["sks_required"],
        );
        if continue_collecting(self.num_completed_rounds, self.config.continue_policy) {
            match get_remaining_rounds(self.num_completed_rounds, self.config.continue_policy) {
                Some(rounds) => tracing::info!(
                    "rounds: completed {}, {} more to collect",
                    self.num_completed_rounds,
                    rounds
                ),
                None => tracing::info!(
                    "rounds: completed {}, continuing indefinitely",
                    self.num_completed_rounds
                ),
            }
        } else {
            tracing::info!(
                "rounds: completed {}, stopping after this collection round",
                self.num_completed_rounds
            );
        }
    }
}

fn lock(state: &Arc<Mutex<TallyServer>>) -> MutexGuard<'_, TallyServer> {
    state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Serve one client connection: handshake, then the status-driven command
/// loop until a checkin closes it.
pub async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    state: Arc<Mutex<TallyServer>>,
    stream: S,
    peer_host: String,
) {
    let mut conn = Connection::new(stream);
    let mut client_uid = None;
    if let Err(e) = drive_connection(&state, &mut conn, &peer_host, &mut client_uid).await {
        tracing::debug!("connection with {} ended: {}", peer_host, e);
        if let Some(uid) = client_uid {
            lock(&state).connection_lost(&uid);
        }
    }
}

async fn drive_connection<S: AsyncRead + AsyncWrite + Unpin>(
    state: &Arc<Mutex<TallyServer>>,
    conn: &mut Connection<S>,
    peer_host: &str,
    client_uid: &mut Option<String>,
) -> privcount_core::Result<()> {
    use privcount_core::Error;

    // initiate the cookie handshake
    let server_cookie = new_cookie();
    conn.send_message(&Message::Handshake1 { server_cookie }).await?;
    match conn.read_message().await? {
        Message::Handshake2 {
            client_cookie,
            password,
        } => {
            let expected = handshake_password(client_cookie, server_cookie);
            if password_matches(password, expected) {
                conn.send_message(&Message::Handshake3 { success: true }).await?;
                conn.set_authenticated();
            } else {
                conn.send_message(&Message::Handshake3 { success: false }).await?;
                return Err(Error::Protocol(format!(
                    "handshake with {peer_host} failed"
                )));
            }
        }
        other => {
            return Err(Error::Protocol(format!(
                "expected HANDSHAKE2, got {other:?}"
            )));
        }
    }
    tracing::debug!("handshake with {} was successful", peer_host);

    let status = lock(state).status();
    let mut last_sent_time = now_epoch();
    conn.send_message(&Message::Status {
        time: last_sent_time,
        status,
    })
    .await?;

    loop {
        match conn.read_message().await? {
            Message::Status {
                time: client_time,
                status,
            } => {
                let mut status: ClientStatus = serde_json::from_value(status)
                    .map_err(|e| Error::Protocol(format!("bad client status: {e}")))?;
                let now = now_epoch();
                status.alive = now;
                status.host = Some(peer_host.to_string());
                if last_sent_time > 0.0 {
                    status.rtt = now - last_sent_time;
                    let latency = status.rtt / 2.0;
                    status.clock_skew = (now - latency - client_time).abs();
                    last_sent_time = 0.0;
                }
                let uid = ClientRegistry::uid_for(peer_host, &status.name);
                *client_uid = Some(uid.clone());

                let next = {
                    let mut server = lock(state);
                    server.set_client_status(&uid, status);
                    if let Some(stop) = server.stop_config_for(&uid) {
                        Message::Stop { config: stop }
                    } else if let Some(start) = server.start_config_for(&uid) {
                        Message::Start { config: start }
                    } else {
                        Message::Checkin {
                            period: server.checkin_period() as u64,
                        }
                    }
                };
                conn.send_message(&next).await?;
            }
            Message::StartResult(result) => {
                let uid = client_uid
                    .clone()
                    .ok_or_else(|| Error::Protocol("START result before STATUS".into()))?;
                let status = {
                    let mut server = lock(state);
                    server.set_start_result(&uid, result.as_ref());
                    server.status()
                };
                last_sent_time = now_epoch();
                conn.send_message(&Message::Status {
                    time: last_sent_time,
                    status,
                })
                .await?;
            }
            Message::StopResult(result) => {
                let uid = client_uid
                    .clone()
                    .ok_or_else(|| Error::Protocol("STOP result before STATUS".into()))?;
                let status = {
                    let mut server = lock(state);
                    server.set_stop_result(&uid, result.as_ref());
                    server.status()
                };
                last_sent_time = now_epoch();
                conn.send_message(&Message::Status {
                    time: last_sent_time,
                    status,
                })
                .await?;
            }
            Message::CheckinSuccess => {
                // the client disconnects and returns after the period
                tracing::debug!("protocol with {} was successful", peer_host);
                return Ok(());
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message from {peer_host}: {other:?}"
                )));
            }
        }
    }
}

/// Run the tally server until the process is stopped.
pub async fn run(config_path: PathBuf) -> anyhow::Result<()> {
    let server = TallyServer::new(&config_path)?;
    let listen_port = server.config.listen_port;
    let event_period = server.config.event_period;
    let state = Arc::new(Mutex::new(server));

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], listen_port))).await?;
    tracing::info!("Tally Server listening on port {}", listen_port);

    let refresh_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs_f64(event_period.max(1.0)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so the initial status
        // reflects at least one event period of client checkins
        interval.tick().await;
        loop {
            interval.tick().await;
            lock(&refresh_state).refresh();
        }
    });

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!("connection from {} was made", peer);
        let state = state.clone();
        tokio::spawn(async move {
            handle_connection(state, stream, peer.ip().to_string()).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_state() -> Arc<Mutex<TallyServer>> {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("ts.key"), "k").expect("key");
        std::fs::write(dir.path().join("ts.cert"), "c").expect("cert");
        let config = r#"
tally_server:
  listen_port: 20001
  state: ts.state
  key: ts.key
  cert: ts.cert
  collect_period: 3600
  dc_threshold: 1
  sk_threshold: 1
  noise_weight:
    "*": 1.0
  counters:
    counters:
      ZeroCount:
        bins:
          - [0, .inf]
  sigmas:
    counters:
      ZeroCount:
        sigma: 0.0
"#;
        let path = dir.path().join("ts.yaml");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(config.as_bytes()).expect("write");
        let server = TallyServer::new(&path).expect("loads");
        // the tempdir must outlive the test: leak it deliberately
        std::mem::forget(dir);
        Arc::new(Mutex::new(server))
    }

    #[tokio::test]
    async fn handshake_and_checkin_cycle() {
        let state = test_state();
        let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(handle_connection(
            state.clone(),
            server_stream,
            "192.0.2.9".to_string(),
        ));

        let mut client = Connection::new(client_stream);
        let Message::Handshake1 { server_cookie } =
            client.read_message().await.expect("handshake1")
        else {
            panic!("expected HANDSHAKE1");
        };
        let client_cookie = new_cookie();
        client
            .send_message(&Message::Handshake2 {
                client_cookie,
                password: handshake_password(client_cookie, server_cookie),
            })
            .await
            .expect("send handshake2");
        assert_eq!(
            client.read_message().await.expect("handshake3"),
            Message::Handshake3 { success: true }
        );
        client.set_authenticated();

        // server sends its status first
        let Message::Status { .. } = client.read_message().await.expect("status") else {
            panic!("expected STATUS");
        };
        client
            .send_message(&Message::Status {
                time: now_epoch(),
                status: serde_json::json!({
                    "type": "ShareKeeper", "name": "sk1", "state": "idle",
                    "public_key": "PEM",
                }),
            })
            .await
            .expect("send status");

        // no round is running, so the server asks for a checkin
        let Message::Checkin { period } = client.read_message().await.expect("checkin") else {
            panic!("expected CHECKIN");
        };
        assert!(period > 0);
        client
            .send_message(&Message::CheckinSuccess)
            .await
            .expect("send checkin success");

        server_task.await.expect("server task");
        let server = lock(&state);
        assert_eq!(server.clients.idle_sks().len(), 1);
    }

    #[tokio::test]
    async fn bad_handshake_is_dropped() {
        let state = test_state();
        let (client_stream, server_stream) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(handle_connection(
            state.clone(),
            server_stream,
            "192.0.2.9".to_string(),
        ));

        let mut client = Connection::new(client_stream);
        let Message::Handshake1 { .. } = client.read_message().await.expect("handshake1") else {
            panic!("expected HANDSHAKE1");
        };
        client
            .send_message(&Message::Handshake2 {
                client_cookie: 0.5,
                password: 0.123,
            })
            .await
            .expect("send bad handshake");
        assert_eq!(
            client.read_message().await.expect("handshake3"),
            Message::Handshake3 { success: false }
        );
        server_task.await.expect("server task");
    }

    #[tokio::test]
    async fn round_starts_once_quorum_checks_in() {
        let state = test_state();
        {
            let mut server = lock(&state);
            let now = now_epoch();
            let dc: ClientStatus = serde_json::from_value(serde_json::json!({
                "type": "DataCollector", "name": "dc1", "state": "idle",
                "fingerprint": "F", "alive": now,
            }))
            .expect("dc status");
            let sk: ClientStatus = serde_json::from_value(serde_json::json!({
                "type": "ShareKeeper", "name": "sk1", "state": "idle",
                "public_key": "PEM", "alive": now,
            }))
            .expect("sk status");
            server.set_client_status("h1~dc1", dc);
            server.set_client_status("h2~sk1", sk);
            server.refresh();
            assert!(server.round.is_some());
            // DC is owed a start config, SK is not yet
            assert!(server.start_config_for("h1~dc1").is_some());
            assert!(server.start_config_for("h2~sk1").is_none());
        }
    }
}
