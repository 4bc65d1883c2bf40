//! Diagnostic inspector
//!
//! Each room may run one inspector: an external process that receives a copy
//! of every video track over plain RTP and writes per-frame diagnostics. The
//! SFU allocates a UDP port, points a plain transport at it, spawns the
//! process and waits for it to report `ready` on stdout.

mod process;

pub use process::{InspectorProcess, ProcessExit, ReadySignal};

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::{InspectorConfig, RouterConfig};
use crate::engine::{
    Consumer, ConsumerOptions, ListenIp, MediaRouter, PlainTransport, PlainTransportOptions,
    Producer, RtpCodecCapability,
};
use crate::error::{Result, SfuError};

/// Why the inspector process stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    ParseArgs,
    InvalidArgs,
    PipelineLink,
    Unknown,
}

impl FailureReason {
    /// Classify an exit code. Signals and unexpected codes are `Unknown`.
    #[must_use]
    pub const fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(1) => Self::ParseArgs,
            Some(2) => Self::InvalidArgs,
            Some(3) => Self::PipelineLink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParseArgs => "parse-args",
            Self::InvalidArgs => "invalid-args",
            Self::PipelineLink => "pipeline-link",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct InspectorState {
    loaded: bool,
    ready: bool,
    closed: bool,
    port: Option<u16>,
    transport: Option<Arc<dyn PlainTransport>>,
    process: Option<Arc<InspectorProcess>>,
    /// Keyed by producer id
    consumers: HashMap<String, Arc<dyn Consumer>>,
    /// Producers with a close observer registered
    watched: HashSet<String>,
}

pub struct Inspector {
    config: InspectorConfig,
    payload_type: Option<u8>,
    codecs: Vec<RtpCodecCapability>,
    router: Arc<dyn MediaRouter>,
    state: Mutex<InspectorState>,
    failures: broadcast::Sender<FailureReason>,
}

impl Inspector {
    pub fn new(
        config: InspectorConfig,
        router_config: &RouterConfig,
        router: Arc<dyn MediaRouter>,
    ) -> Arc<Self> {
        let codecs = router_config
            .media_codecs
            .iter()
            .filter(|c| c.mime_type.eq_ignore_ascii_case(&config.codec_mime_type))
            .cloned()
            .collect();
        let payload_type = router_config.payload_type(&config.codec_mime_type);
        let (failures, _) = broadcast::channel(8);

        Arc::new(Self {
            config,
            payload_type,
            codecs,
            router,
            state: Mutex::new(InspectorState::default()),
            failures,
        })
    }

    /// Crashes after `ready`. Failures before `ready` are returned by `load`.
    pub fn failures(&self) -> broadcast::Receiver<FailureReason> {
        self.failures.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        state.ready && !state.closed
    }

    pub fn port(&self) -> Option<u16> {
        self.state.lock().port
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Start the inspector and wait until it reports ready.
    pub async fn load(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.loaded || state.closed {
                return Err(SfuError::AlreadyInState(
                    "inspector was already loaded".to_string(),
                ));
            }
            state.loaded = true;
        }

        let payload_type = self.payload_type.ok_or_else(|| {
            SfuError::InvalidRequest(format!(
                "codec {} is not configured on the router",
                self.config.codec_mime_type
            ))
        })?;

        let port = pick_port(self.config.connect_ip, self.config.min_port, self.config.max_port).await?;

        let transport = self
            .router
            .create_plain_transport(&PlainTransportOptions {
                listen_ip: ListenIp {
                    ip: self.config.listen_ip,
                    announced_ip: None,
                },
                comedia: false,
                rtcp_mux: true,
            })
            .await?;

        if let Err(e) = transport.connect(self.config.connect_ip, port).await {
            transport.close();
            return Err(e);
        }

        {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                transport.close();
                return Err(SfuError::NotReady("inspector closed while loading".to_string()));
            }
            state.port = Some(port);
            state.transport = Some(Arc::clone(&transport));
        }

        let mut command = Command::new(&self.config.command);
        command
            .arg("--port")
            .arg(port.to_string())
            .arg("--payloadType")
            .arg(payload_type.to_string())
            .arg("--outputPath")
            .arg(&self.config.output_path);

        let (process, ready) = match InspectorProcess::spawn(command) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(
                    command = %self.config.command.display(),
                    error = %e,
                    "Failed to spawn inspector"
                );
                self.close().await;
                return Err(e);
            }
        };
        let process = Arc::new(process);
        let closed = {
            let mut state = self.state.lock();
            if !state.closed {
                state.process = Some(Arc::clone(&process));
            }
            state.closed
        };
        if closed {
            process.shutdown(self.config.kill_timeout()).await;
            return Err(SfuError::NotReady("inspector closed while loading".to_string()));
        }

        if let Err(exit) = process.wait_ready(ready).await {
            let reason = FailureReason::from_exit_code(exit.code);
            error!(code = ?exit.code, %reason, "Inspector exited before becoming ready");
            self.close().await;
            return Err(SfuError::ProcessFailure { reason });
        }

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SfuError::NotReady("inspector closed while loading".to_string()));
            }
            state.ready = true;
        }

        info!(port, pid = ?process.pid(), "Inspector loaded");
        tokio::spawn(watch_exit(Arc::downgrade(self), process));

        Ok(())
    }

    /// Forward `producer` to the inspector.
    pub async fn create_consumer(self: &Arc<Self>, producer: &Arc<dyn Producer>) -> Result<()> {
        let transport = {
            let state = self.state.lock();
            match (&state.transport, state.ready && !state.closed) {
                (Some(transport), true) => Arc::clone(transport),
                _ => return Err(SfuError::NotReady("inspector is not ready".to_string())),
            }
        };

        let producer_id = producer.id().to_string();
        let consumer = transport
            .consume(ConsumerOptions {
                producer_id: producer_id.clone(),
                rtp_capabilities: json!({ "codecs": self.codecs }),
                paused: true,
                app_data: Value::Null,
            })
            .await?;

        let (previous, first_consumer) = {
            let mut state = self.state.lock();
            if state.closed {
                drop(state);
                consumer.close();
                return Err(SfuError::NotReady("inspector is closed".to_string()));
            }
            let previous = state.consumers.insert(producer_id.clone(), Arc::clone(&consumer));
            (previous, state.watched.insert(producer_id.clone()))
        };
        if let Some(previous) = previous {
            previous.close();
        }

        if first_consumer {
            let inspector = Arc::downgrade(self);
            let key = producer_id.clone();
            producer.on_close(Box::new(move || {
                if let Some(inspector) = inspector.upgrade() {
                    inspector.on_producer_closed(&key);
                }
            }));
        }

        if producer.closed() {
            self.forget_consumer(&producer_id, consumer.id());
            consumer.close();
            return Err(SfuError::NotFound(format!("producer {producer_id} is closed")));
        }

        consumer.resume().await?;
        debug!(producer_id = %producer_id, consumer_id = %consumer.id(), "Inspector consuming track");
        Ok(())
    }

    /// Tear everything down. Never fails; safe to call more than once.
    pub async fn close(&self) {
        let (consumers, transport, process) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.ready = false;
            (
                state.consumers.drain().map(|(_, c)| c).collect::<Vec<_>>(),
                state.transport.take(),
                state.process.take(),
            )
        };

        for consumer in consumers {
            consumer.close();
        }
        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(process) = process {
            let exit = process.shutdown(self.config.kill_timeout()).await;
            debug!(code = ?exit.code, "Inspector process stopped");
        }

        info!("Inspector closed");
    }

    fn on_producer_closed(&self, producer_id: &str) {
        let consumer = {
            let mut state = self.state.lock();
            state.watched.remove(producer_id);
            state.consumers.remove(producer_id)
        };
        if let Some(consumer) = consumer {
            debug!(producer_id, "Producer closed, closing inspector consumer");
            consumer.close();
        }
    }

    fn forget_consumer(&self, producer_id: &str, consumer_id: &str) {
        let mut state = self.state.lock();
        if state
            .consumers
            .get(producer_id)
            .is_some_and(|c| c.id() == consumer_id)
        {
            state.consumers.remove(producer_id);
        }
    }
}

/// Report a crash that happens after `ready`
async fn watch_exit(inspector: Weak<Inspector>, process: Arc<InspectorProcess>) {
    let exit = process.wait_exit().await;
    let Some(inspector) = inspector.upgrade() else {
        return;
    };
    if inspector.state.lock().closed {
        return;
    }

    if exit.code == Some(0) {
        info!("Inspector exited");
    } else {
        let reason = FailureReason::from_exit_code(exit.code);
        error!(code = ?exit.code, %reason, "Inspector crashed");
        let _ = inspector.failures.send(reason);
    }

    inspector.close().await;
}

/// Find a free UDP port in `[min, max]`, starting the scan at a random offset
async fn pick_port(ip: IpAddr, min: u16, max: u16) -> Result<u16> {
    if min > max {
        return Err(SfuError::InvalidRequest(format!(
            "invalid port range {min}-{max}"
        )));
    }

    let span = u32::from(max - min) + 1;
    let start = rand::thread_rng().gen_range(0..span);
    for offset in 0..span {
        let Ok(port) = u16::try_from(u32::from(min) + (start + offset) % span) else {
            continue;
        };
        match UdpSocket::bind((ip, port)).await {
            Ok(_) => return Ok(port),
            Err(e) => debug!(port, error = %e, "Port unavailable"),
        }
    }

    warn!(min, max, "No free UDP port for inspector");
    Err(SfuError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrInUse,
        format!("no free UDP port in {min}-{max}"),
    )))
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MediaKind;
    use crate::mock::FakeRouter;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn test_config(command: &str) -> InspectorConfig {
        InspectorConfig {
            enabled: true,
            command: command.into(),
            kill_timeout_ms: 1_000,
            ..InspectorConfig::default()
        }
    }

    #[test]
    fn test_failure_reasons() {
        assert_eq!(FailureReason::from_exit_code(Some(1)), FailureReason::ParseArgs);
        assert_eq!(FailureReason::from_exit_code(Some(2)), FailureReason::InvalidArgs);
        assert_eq!(FailureReason::from_exit_code(Some(3)), FailureReason::PipelineLink);
        assert_eq!(FailureReason::from_exit_code(Some(0)), FailureReason::Unknown);
        assert_eq!(FailureReason::from_exit_code(Some(42)), FailureReason::Unknown);
        assert_eq!(FailureReason::from_exit_code(None), FailureReason::Unknown);
        assert_eq!(FailureReason::PipelineLink.to_string(), "pipeline-link");
    }

    #[tokio::test]
    async fn test_pick_port_in_range() {
        let port = pick_port(IpAddr::V4(Ipv4Addr::LOCALHOST), 30_000, 35_000)
            .await
            .unwrap();
        assert!((30_000..=35_000).contains(&port));

        assert!(pick_port(IpAddr::V4(Ipv4Addr::LOCALHOST), 10, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_create_consumer_requires_ready() {
        let router = FakeRouter::new("router-1");
        let inspector = Inspector::new(
            test_config("/nonexistent/inspector"),
            &RouterConfig::default(),
            router.clone(),
        );

        let producer: Arc<dyn Producer> = router.standalone_producer(MediaKind::Video);
        let err = inspector.create_consumer(&producer).await.unwrap_err();
        assert!(matches!(err, SfuError::NotReady(_)));
    }

    #[tokio::test]
    async fn test_load_spawn_failure_cleans_up() {
        let router = FakeRouter::new("router-1");
        let inspector = Inspector::new(
            test_config("/nonexistent/inspector"),
            &RouterConfig::default(),
            router.clone(),
        );

        let err = inspector.load().await.unwrap_err();
        assert!(matches!(err, SfuError::Io(_)));

        // the plain transport was opened, connected and then released
        let transports = router.plain_transports();
        assert_eq!(transports.len(), 1);
        assert!(transports[0].connected_to().is_some());
        assert!(transports[0].is_closed());
        assert!(!inspector.is_ready());

        // a second load is rejected
        assert!(matches!(
            inspector.load().await.unwrap_err(),
            SfuError::AlreadyInState(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_reports_process_failure() {
        // `sh` rejects the inspector flags and exits before reporting ready
        let router = FakeRouter::new("router-1");
        let inspector = Inspector::new(test_config("sh"), &RouterConfig::default(), router.clone());

        let err = inspector.load().await.unwrap_err();
        assert!(matches!(err, SfuError::ProcessFailure { .. }));
        assert!(router.plain_transports()[0].is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let router = FakeRouter::new("router-1");
        let inspector = Inspector::new(
            test_config("/nonexistent/inspector"),
            &RouterConfig::default(),
            router,
        );

        inspector.close().await;
        inspector.close().await;
        assert!(!inspector.is_ready());
        assert!(matches!(
            inspector.load().await.unwrap_err(),
            SfuError::AlreadyInState(_)
        ));
    }
    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_waits_for_ready() {
        use super::scripts::{Script, READY};

        let script = Script::new(READY);
        let router = FakeRouter::new("router-1");
        let config = InspectorConfig {
            output_path: "/tmp/inspector-logs".into(),
            ..test_config(script.path().to_str().unwrap())
        };
        let router_config = RouterConfig::default();
        let payload_type = router_config.payload_type("video/VP8").unwrap();
        let inspector = Inspector::new(config, &router_config, router.clone());

        inspector.load().await.unwrap();
        assert!(inspector.is_ready());

        let port = inspector.port().unwrap();
        assert_eq!(
            script.args(),
            format!("--port {port} --payloadType {payload_type} --outputPath /tmp/inspector-logs")
        );
        let transports = router.plain_transports();
        assert_eq!(transports.len(), 1);
        assert_eq!(
            transports[0].connected_to(),
            Some((IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        );

        inspector.close().await;
        assert!(transports[0].is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_consumers_follow_producers_and_close() {
        use super::scripts::{Script, READY};

        let script = Script::new(READY);
        let router = FakeRouter::new("router-1");
        let inspector = Inspector::new(
            test_config(script.path().to_str().unwrap()),
            &RouterConfig::default(),
            router.clone(),
        );
        inspector.load().await.unwrap();

        let video = router.standalone_producer(MediaKind::Video);
        let other = router.standalone_producer(MediaKind::Video);
        for producer in [&video, &other] {
            let producer: Arc<dyn Producer> = producer.clone();
            inspector.create_consumer(&producer).await.unwrap();
        }
        assert_eq!(inspector.consumer_count(), 2);

        let transport = router.plain_transports()[0].clone();
        let requests = transport.consume_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.paused));
        let codecs = requests[0].rtp_capabilities["codecs"].as_array().unwrap();
        assert_eq!(codecs.len(), 1);
        assert_eq!(codecs[0]["mimeType"], "video/VP8");

        // created paused, resumed once registered
        let consumers = transport.consumers();
        assert!(consumers.iter().all(|c| !c.paused()));

        // one close observer per producer, however often it is consumed
        let observers = video.close_observers();
        let producer: Arc<dyn Producer> = video.clone();
        inspector.create_consumer(&producer).await.unwrap();
        assert_eq!(video.close_observers(), observers);
        assert_eq!(inspector.consumer_count(), 2);

        video.close();
        assert_eq!(inspector.consumer_count(), 1);
        let consumers = transport.consumers();
        assert_eq!(consumers.len(), 3);
        assert!(consumers
            .iter()
            .filter(|c| c.producer_id() == video.id())
            .all(|c| c.closed()));

        inspector.close().await;
        assert_eq!(inspector.consumer_count(), 0);
        assert!(consumers.iter().all(|c| c.closed()));
        assert!(transport.is_closed());
        assert!(!inspector.is_ready());

        let producer: Arc<dyn Producer> = other.clone();
        assert!(matches!(
            inspector.create_consumer(&producer).await.unwrap_err(),
            SfuError::NotReady(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_after_ready_is_reported() {
        use super::scripts::{Script, CRASH_AFTER_READY};

        let script = Script::new(CRASH_AFTER_READY);
        let router = FakeRouter::new("router-1");
        let inspector = Inspector::new(
            test_config(script.path().to_str().unwrap()),
            &RouterConfig::default(),
            router.clone(),
        );
        let mut failures = inspector.failures();

        inspector.load().await.unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(5), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, FailureReason::PipelineLink);

        for _ in 0..200 {
            if !inspector.is_ready() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!inspector.is_ready());
        assert!(router.plain_transports()[0].is_closed());
        assert!(!router.is_closed());
    }
}
