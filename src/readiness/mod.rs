//! Generic readiness probing.
//!
//! A probe round tries each target in order and succeeds on the first one
//! that answers. A service is declared ready only after `success_threshold`
//! consecutive successful rounds, which filters listeners that flap while the
//! service is still initialising.

pub mod transport;

pub use transport::{NetworkTransport, Transport};

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{BootstrapError, Result};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Emit a progress line every this many attempts.
const PROGRESS_EVERY: u32 = 30;

/// Something that can be asked "are you up?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    /// Succeeds once a TCP connection is accepted.
    Tcp(String),
    /// Succeeds on a 2xx response to a GET.
    Http(String),
    /// Succeeds once a unix-domain socket accepts a connection.
    Unix(PathBuf),
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Http(url) => f.write_str(url),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl FromStr for ProbeTarget {
    type Err = BootstrapError;

    /// `tcp://host:port`, `unix:///path` or an `http(s)://` URL.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            let valid = addr
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if valid {
                return Ok(Self::Tcp(addr.to_string()));
            }
        } else if let Some(path) = s.strip_prefix("unix://") {
            if !path.is_empty() {
                return Ok(Self::Unix(PathBuf::from(path)));
            }
        } else if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(Self::Http(s.to_string()));
        }
        Err(BootstrapError::InvalidProbeSpec(format!(
            "unrecognised probe target '{s}' (expected tcp://host:port, unix:///path or http(s)://url)"
        )))
    }
}

/// Result of a single request against a single target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    /// The target answered but refused the request's credentials (401/403).
    Unauthorized(u16),
    NotReady(String),
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Unauthorized(code) => write!(f, "unauthorized (HTTP {code})"),
            Self::NotReady(reason) => f.write_str(reason),
        }
    }
}

/// Probe policy for one service. Built per probing call.
///
/// Only obtainable through [`ProbeSpec::new`], so targets are never empty and
/// `1 <= success_threshold <= max_attempts` always holds.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    name: String,
    targets: Vec<ProbeTarget>,
    success_threshold: u32,
    max_attempts: u32,
    interval: Duration,
    per_attempt_timeout: Duration,
    credential: Option<String>,
    /// Log file to point operators at when the probe gives up.
    log_hint: Option<PathBuf>,
}

impl ProbeSpec {
    /// Rejects specs that could never succeed instead of clamping them.
    pub fn new(
        name: impl Into<String>,
        targets: Vec<ProbeTarget>,
        success_threshold: u32,
        max_attempts: u32,
    ) -> Result<Self> {
        let name = name.into();
        if targets.is_empty() {
            return Err(BootstrapError::InvalidProbeSpec(format!(
                "{name}: at least one target is required"
            )));
        }
        if success_threshold == 0 {
            return Err(BootstrapError::InvalidProbeSpec(format!(
                "{name}: success threshold must be at least 1"
            )));
        }
        if success_threshold > max_attempts {
            return Err(BootstrapError::InvalidProbeSpec(format!(
                "{name}: success threshold {success_threshold} exceeds max attempts {max_attempts}"
            )));
        }

        Ok(Self {
            name,
            targets,
            success_threshold,
            max_attempts,
            interval: DEFAULT_INTERVAL,
            per_attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            credential: None,
            log_hint: None,
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = timeout;
        self
    }

    pub fn with_credential(mut self, token: Option<String>) -> Self {
        self.credential = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_log_hint(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_hint = Some(path.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn targets(&self) -> &[ProbeTarget] {
        &self.targets
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn per_attempt_timeout(&self) -> Duration {
        self.per_attempt_timeout
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn log_hint(&self) -> Option<&Path> {
        self.log_hint.as_deref()
    }

    /// Wall-clock budget for the whole probe.
    pub fn deadline(&self) -> Duration {
        (self.interval + self.per_attempt_timeout).saturating_mul(self.max_attempts)
    }
}

/// Consecutive-success counter. Any failure resets it to zero.
#[derive(Debug, Clone)]
pub struct SuccessStreak {
    threshold: u32,
    current: u32,
}

impl SuccessStreak {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            current: 0,
        }
    }

    /// Record a round; returns true once the threshold is reached.
    pub fn record(&mut self, success: bool) -> bool {
        if success {
            self.current += 1;
        } else {
            self.current = 0;
        }
        self.is_satisfied()
    }

    pub fn current(&self) -> u32 {
        self.current
    }

    pub fn is_satisfied(&self) -> bool {
        self.current >= self.threshold
    }
}

#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Rounds executed, including the successful ones.
    pub attempts: u32,
    pub elapsed: Duration,
    /// Target that answered in the final round.
    pub ready_target: ProbeTarget,
}

/// Runs `ProbeSpec`s against a transport.
pub struct ReadinessProber<T: Transport = NetworkTransport> {
    transport: T,
}

impl<T: Transport> ReadinessProber<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Block until the spec's policy is satisfied or its budget runs out.
    pub async fn await_ready(&self, spec: &ProbeSpec) -> Result<ProbeReport> {
        let started = Instant::now();
        let deadline = started + spec.deadline();
        let mut streak = SuccessStreak::new(spec.success_threshold);
        let mut last_result = String::from("no attempt made");
        let mut attempts = 0;

        debug!(
            probe = %spec.name,
            targets = spec.targets.len(),
            threshold = spec.success_threshold,
            max_attempts = spec.max_attempts,
            "Waiting for readiness"
        );

        while attempts < spec.max_attempts {
            if attempts > 0 && Instant::now() >= deadline {
                debug!(probe = %spec.name, attempts, "Probe deadline reached");
                break;
            }
            attempts += 1;

            match self.round(spec).await {
                Ok(target) => {
                    if streak.record(true) {
                        info!(probe = %spec.name, attempts, target = %target, "Ready");
                        return Ok(ProbeReport {
                            attempts,
                            elapsed: started.elapsed(),
                            ready_target: target,
                        });
                    }
                    last_result = format!("ready via {target}");
                }
                Err(reason) => {
                    streak.record(false);
                    last_result = reason;
                }
            }

            debug!(
                probe = %spec.name,
                attempt = attempts,
                consecutive = streak.current(),
                result = %last_result,
                "Probe round finished"
            );
            if attempts % PROGRESS_EVERY == 0 {
                info!(
                    "Still waiting for {}... ({}/{} attempts, {}/{} consecutive successes)",
                    spec.name,
                    attempts,
                    spec.max_attempts,
                    streak.current(),
                    spec.success_threshold
                );
            }

            if attempts < spec.max_attempts {
                tokio::time::sleep(spec.interval).await;
            }
        }

        Err(BootstrapError::ReadinessTimeout {
            probe: spec.name.clone(),
            attempts,
            last_result,
            log_hint: spec.log_hint.clone(),
        })
    }

    /// One pass over the targets. Returns the first target that answered,
    /// or a description of the last failure.
    async fn round(&self, spec: &ProbeSpec) -> std::result::Result<ProbeTarget, String> {
        let mut last = String::new();

        for target in &spec.targets {
            let mut outcome = self.attempt(target, None, spec.per_attempt_timeout).await;

            if let (ProbeOutcome::Unauthorized(code), Some(token)) =
                (&outcome, spec.credential.as_deref())
            {
                debug!(target = %target, code, "Retrying with bearer credential");
                outcome = self
                    .attempt(target, Some(token), spec.per_attempt_timeout)
                    .await;
            }

            if outcome == ProbeOutcome::Ready {
                return Ok(target.clone());
            }
            last = format!("{target}: {outcome}");
        }

        Err(last)
    }

    async fn attempt(
        &self,
        target: &ProbeTarget,
        credential: Option<&str>,
        timeout: Duration,
    ) -> ProbeOutcome {
        match tokio::time::timeout(timeout, self.transport.attempt(target, credential)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::NotReady(format!("timed out after {timeout:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Answers each call with the next scripted result; `Ready` once exhausted.
    struct Scripted {
        script: Mutex<VecDeque<bool>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(script: &[bool]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                calls: AtomicU32::new(0),
            }
        }

        fn always_ready() -> Self {
            Self::new(&[])
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn attempt(&self, _target: &ProbeTarget, _credential: Option<&str>) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(false) => ProbeOutcome::NotReady("connection refused".into()),
                _ => ProbeOutcome::Ready,
            }
        }
    }

    /// Denies every request that does not carry `token`.
    struct TokenGate {
        token: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Transport for TokenGate {
        async fn attempt(&self, _target: &ProbeTarget, credential: Option<&str>) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if credential == Some(self.token) {
                ProbeOutcome::Ready
            } else {
                ProbeOutcome::Unauthorized(401)
            }
        }
    }

    struct Hangs;

    #[async_trait]
    impl Transport for Hangs {
        async fn attempt(&self, _target: &ProbeTarget, _credential: Option<&str>) -> ProbeOutcome {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ProbeOutcome::Ready
        }
    }

    fn http(url: &str) -> ProbeTarget {
        ProbeTarget::Http(url.to_string())
    }

    fn spec(threshold: u32, attempts: u32) -> ProbeSpec {
        ProbeSpec::new("svc", vec![http("http://127.0.0.1:1/ready")], threshold, attempts)
            .unwrap()
            .with_interval(Duration::from_millis(100))
    }

    #[test]
    fn threshold_above_attempts_is_rejected() {
        let err = ProbeSpec::new("svc", vec![http("http://x")], 5, 4).unwrap_err();
        assert!(matches!(err, BootstrapError::InvalidProbeSpec(_)));
        assert!(ProbeSpec::new("svc", vec![http("http://x")], 4, 4).is_ok());
    }

    #[test]
    fn zero_threshold_and_empty_targets_are_rejected() {
        assert!(ProbeSpec::new("svc", vec![http("http://x")], 0, 4).is_err());
        assert!(ProbeSpec::new("svc", Vec::new(), 1, 4).is_err());
    }

    #[test]
    fn streak_resets_on_any_failure() {
        let mut streak = SuccessStreak::new(3);
        assert!(!streak.record(false));
        assert_eq!(streak.current(), 0);
        assert!(!streak.record(true));
        assert!(!streak.record(true));
        assert!(!streak.record(false));
        assert_eq!(streak.current(), 0);
        assert!(!streak.record(true));
        assert!(!streak.record(true));
        assert!(streak.record(true));
    }

    #[tokio::test(start_paused = true)]
    async fn needs_threshold_rounds_even_when_all_targets_answer() {
        let transport = Scripted::always_ready();
        let prober = ReadinessProber::new(transport);
        let spec = ProbeSpec::new(
            "apiserver",
            vec![http("https://a/readyz"), http("https://b/readyz"), http("https://c/livez")],
            3,
            10,
        )
        .unwrap();

        let report = prober.await_ready(&spec).await.unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(report.ready_target, http("https://a/readyz"));
        // First target answers each round, so later targets are never tried.
        assert_eq!(prober.transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_restarts_the_count() {
        let prober = ReadinessProber::new(Scripted::new(&[true, true, false, true, true, true]));
        let report = prober.await_ready(&spec(3, 10)).await.unwrap();
        assert_eq!(report.attempts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn alternating_results_never_satisfy_threshold() {
        let script = [true, false, true, false, true, false];
        let prober = ReadinessProber::new(Scripted::new(&script));
        let err = prober.await_ready(&spec(2, 6)).await.unwrap_err();
        match err {
            BootstrapError::ReadinessTimeout { attempts, .. } => assert_eq!(attempts, 6),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn later_target_can_carry_the_round() {
        struct SecondOnly;

        #[async_trait]
        impl Transport for SecondOnly {
            async fn attempt(&self, target: &ProbeTarget, _: Option<&str>) -> ProbeOutcome {
                if *target == ProbeTarget::Tcp("second:1".into()) {
                    ProbeOutcome::Ready
                } else {
                    ProbeOutcome::NotReady("refused".into())
                }
            }
        }

        let spec = ProbeSpec::new(
            "svc",
            vec![
                ProbeTarget::Tcp("first:1".into()),
                ProbeTarget::Tcp("second:1".into()),
            ],
            1,
            3,
        )
        .unwrap();
        let report = ReadinessProber::new(SecondOnly).await_ready(&spec).await.unwrap();
        assert_eq!(report.ready_target, ProbeTarget::Tcp("second:1".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_without_credential_times_out() {
        let prober = ReadinessProber::new(TokenGate {
            token: "abc123.0123456789abcdef",
            calls: AtomicU32::new(0),
        });
        let spec = spec(1, 5).with_log_hint("/var/log/kubernetes/apiserver.log");

        let err = prober.await_ready(&spec).await.unwrap_err();
        match &err {
            BootstrapError::ReadinessTimeout {
                attempts,
                last_result,
                ..
            } => {
                assert_eq!(*attempts, 5);
                assert!(last_result.contains("unauthorized"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.log_hint().is_some());
        assert_eq!(prober.transport.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_retries_once_with_credential() {
        let prober = ReadinessProber::new(TokenGate {
            token: "abc123.0123456789abcdef",
            calls: AtomicU32::new(0),
        });
        let spec = spec(2, 5).with_credential(Some("abc123.0123456789abcdef".into()));

        let report = prober.await_ready(&spec).await.unwrap();
        assert_eq!(report.attempts, 2);
        // Anonymous try plus credentialed retry in each round.
        assert_eq!(prober.transport.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_target_counts_as_failure() {
        let spec = spec(1, 2).with_timeout(Duration::from_millis(50));
        let err = ReadinessProber::new(Hangs).await_ready(&spec).await.unwrap_err();
        match err {
            BootstrapError::ReadinessTimeout { last_result, .. } => {
                assert!(last_result.contains("timed out"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn targets_parse_from_urls() {
        assert_eq!(
            "tcp://127.0.0.1:6443".parse::<ProbeTarget>().unwrap(),
            ProbeTarget::Tcp("127.0.0.1:6443".into())
        );
        assert_eq!(
            "unix:///run/containerd/containerd.sock".parse::<ProbeTarget>().unwrap(),
            ProbeTarget::Unix("/run/containerd/containerd.sock".into())
        );
        assert_eq!(
            "https://127.0.0.1:6443/readyz".parse::<ProbeTarget>().unwrap(),
            http("https://127.0.0.1:6443/readyz")
        );
        for bad in ["tcp://nohost", "tcp://:80", "unix://", "ftp://x", "localhost:80"] {
            assert!(bad.parse::<ProbeTarget>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn builders_keep_policy_bounds() {
        let spec = ProbeSpec::new("svc", vec![http("http://x")], 2, 3)
            .unwrap()
            .with_interval(Duration::from_millis(10))
            .with_timeout(Duration::from_millis(20))
            .with_credential(Some(String::new()))
            .with_log_hint("/var/log/kubernetes/svc.log");

        assert_eq!(spec.name(), "svc");
        assert_eq!(spec.targets(), [http("http://x")]);
        assert_eq!(spec.success_threshold(), 2);
        assert_eq!(spec.max_attempts(), 3);
        assert_eq!(spec.per_attempt_timeout(), Duration::from_millis(20));
        // An empty token is the same as none.
        assert!(spec.credential().is_none());
        assert_eq!(
            spec.log_hint(),
            Some(Path::new("/var/log/kubernetes/svc.log"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wall_clock_budget_stops_before_max_attempts() {
        let targets = vec![
            ProbeTarget::Tcp("a:1".into()),
            ProbeTarget::Tcp("b:1".into()),
            ProbeTarget::Tcp("c:1".into()),
        ];
        let spec = ProbeSpec::new("slow", targets, 1, 10)
            .unwrap()
            .with_interval(Duration::from_millis(100))
            .with_timeout(Duration::from_millis(100));
        assert_eq!(spec.deadline(), Duration::from_secs(2));

        let started = Instant::now();
        let err = ReadinessProber::new(Hangs).await_ready(&spec).await.unwrap_err();

        // Each round burns 300ms on three hung targets plus a 100ms pause,
        // so the 2s budget is spent after five rounds.
        match err {
            BootstrapError::ReadinessTimeout { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected error: {other}"),
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= spec.deadline());
        assert!(elapsed < spec.deadline() + Duration::from_millis(400));
    }

    #[test]
    fn deadline_covers_every_attempt() {
        let spec = spec(1, 10).with_timeout(Duration::from_millis(400));
        assert_eq!(spec.deadline(), Duration::from_millis(5000));
    }
}
