//! Per-client request admission: a sliding-window rate limit plus a cap on
//! in-flight requests.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use {
    axum::{
        body::Body,
        extract::{ConnectInfo, Request, State},
        http::HeaderMap,
        middleware::Next,
        response::{IntoResponse, Response},
    },
    futures::StreamExt,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {embody_config::RateLimitConfig, embody_protocol::headers};

use crate::{error::GatewayError, state::GatewayState};

/// Seconds a rate-limited client is told to wait.
pub const RETRY_AFTER_SECS: u64 = 60;

const WINDOW: Duration = Duration::from_secs(60);

/// Who is making a request, as far as admission is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub address: String,
    pub agent_id: Option<String>,
}

impl ClientIdentity {
    pub fn from_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            agent_id: None,
        }
    }

    /// Peer address, or the first `X-Forwarded-For` hop when trusted.
    pub fn from_request(
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        trust_forwarded_for: bool,
    ) -> Self {
        let forwarded = trust_forwarded_for
            .then(|| {
                headers
                    .get(headers::FORWARDED_FOR)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.split(',').next())
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            })
            .flatten();
        let address = forwarded
            .or_else(|| peer.map(|p| p.ip().to_string()))
            .unwrap_or_else(|| "unknown".into());
        Self::from_address(address)
    }
}

#[derive(Debug)]
pub enum Admission {
    /// Proceed. The permit, when present, must live until the response is
    /// fully sent.
    Allow(Option<ConcurrencyPermit>),
    RateLimited { retry_after: u64 },
    ConcurrencyLimited,
    /// Admission state is unusable and fail-closed is configured.
    Unavailable,
}

#[derive(Debug)]
struct RateWindowEntry {
    requests: VecDeque<Instant>,
    last_cleanup: Instant,
}

impl RateWindowEntry {
    fn new(now: Instant) -> Self {
        Self {
            requests: VecDeque::new(),
            last_cleanup: now,
        }
    }

    /// Drop timestamps older than the window and return what remains.
    fn prune(&mut self, now: Instant) -> usize {
        while let Some(&oldest) = self.requests.front() {
            if now.duration_since(oldest) >= WINDOW {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        self.last_cleanup = now;
        self.requests.len()
    }
}

#[derive(Debug)]
struct ConcurrencySlot {
    count: usize,
    expires_at: Instant,
    /// Permits only release the slot they were issued from, never a newer
    /// one created under the same key after a sweep.
    generation: u64,
}

#[derive(Debug, Default)]
struct AdmissionState {
    windows: HashMap<String, RateWindowEntry>,
    slots: HashMap<String, ConcurrencySlot>,
    next_generation: u64,
}

pub struct RateAdmission {
    config: RateLimitConfig,
    state: Arc<Mutex<AdmissionState>>,
}

impl RateAdmission {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(AdmissionState::default())),
        }
    }

    pub fn is_exempt(&self, client: &ClientIdentity) -> bool {
        self.config
            .exempt_prefixes
            .iter()
            .any(|prefix| client.address.starts_with(prefix.as_str()))
    }

    pub fn admit(&self, client: &ClientIdentity) -> Admission {
        self.admit_at(client, Instant::now())
    }

    fn admit_at(&self, client: &ClientIdentity, now: Instant) -> Admission {
        if self.is_exempt(client) {
            return Admission::Allow(None);
        }

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) if self.config.fail_closed => {
                warn!(client = %client.address, "admission state poisoned, rejecting");
                return Admission::Unavailable;
            },
            Err(_) => {
                warn!(client = %client.address, "admission state poisoned, admitting");
                return Admission::Allow(None);
            },
        };

        let rate_limit = self.config.requests_per_minute as usize;
        let max_concurrent = self.config.max_concurrent_requests as usize;

        if rate_limit > 0 {
            let in_window = state
                .windows
                .get_mut(&client.address)
                .map_or(0, |entry| entry.prune(now));
            if in_window >= rate_limit {
                debug!(client = %client.address, in_window, "rate limited");
                return Admission::RateLimited {
                    retry_after: RETRY_AFTER_SECS,
                };
            }
        }

        if max_concurrent > 0 {
            let in_flight = state.slots.get(&client.address).map_or(0, |s| s.count);
            if in_flight >= max_concurrent {
                debug!(client = %client.address, in_flight, "concurrency limited");
                return Admission::ConcurrencyLimited;
            }
        }

        if rate_limit > 0 {
            state
                .windows
                .entry(client.address.clone())
                .or_insert_with(|| RateWindowEntry::new(now))
                .requests
                .push_back(now);
        }

        if max_concurrent == 0 {
            return Admission::Allow(None);
        }
        let ttl = Duration::from_secs(self.config.slot_ttl_secs);
        if !state.slots.contains_key(&client.address) {
            state.next_generation += 1;
        }
        let generation = state.next_generation;
        let slot = state
            .slots
            .entry(client.address.clone())
            .or_insert(ConcurrencySlot {
                count: 0,
                expires_at: now + ttl,
                generation,
            });
        slot.count += 1;
        slot.expires_at = now + ttl;

        Admission::Allow(Some(ConcurrencyPermit {
            key: client.address.clone(),
            generation: slot.generation,
            state: Arc::clone(&self.state),
        }))
    }

    /// Evict empty windows and expired slots. Returns how many entries
    /// were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut state = lock_recovering(&self.state);
        let before = state.windows.len() + state.slots.len();
        state.windows.retain(|_, entry| entry.prune(now) > 0);
        state.slots.retain(|_, slot| slot.expires_at > now);
        before - (state.windows.len() + state.slots.len())
    }

    /// Run `sweep` on the configured interval until `cancel` fires.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = self.sweep();
                        if removed > 0 {
                            info!(removed, "admission sweep");
                        }
                    },
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self, address: &str) -> usize {
        lock_recovering(&self.state)
            .slots
            .get(address)
            .map_or(0, |s| s.count)
    }
}

fn lock_recovering(state: &Mutex<AdmissionState>) -> MutexGuard<'_, AdmissionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One held concurrency slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    key: String,
    generation: u64,
    state: Arc<Mutex<AdmissionState>>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        let mut state = lock_recovering(&self.state);
        if let Some(slot) = state.slots.get_mut(&self.key)
            && slot.generation == self.generation
        {
            slot.count = slot.count.saturating_sub(1);
            if slot.count == 0 {
                state.slots.remove(&self.key);
            }
        }
    }
}

// ── Middleware ───────────────────────────────────────────────────────────────

/// Admit or reject the request. An admitted request keeps its concurrency
/// slot until the response body has been fully streamed or dropped.
pub async fn admission_layer(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = ClientIdentity::from_request(
        request.headers(),
        peer,
        state.config.server.trust_forwarded_for,
    );

    let permit = match state.admission.admit(&client) {
        Admission::Allow(permit) => permit,
        Admission::RateLimited { retry_after } => {
            return GatewayError::RateLimited { retry_after }.into_response();
        },
        Admission::ConcurrencyLimited => {
            return GatewayError::ConcurrencyLimited.into_response();
        },
        Admission::Unavailable => {
            return GatewayError::Unavailable("admission temporarily unavailable".into())
                .into_response();
        },
    };

    let response = next.run(request).await;
    match permit {
        Some(permit) => {
            let (parts, body) = response.into_parts();
            let body = body.into_data_stream().map(move |chunk| {
                let _held = &permit;
                chunk
            });
            Response::from_parts(parts, Body::from_stream(body))
        },
        None => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission(rpm: u32, concurrent: u32) -> RateAdmission {
        RateAdmission::new(RateLimitConfig {
            requests_per_minute: rpm,
            max_concurrent_requests: concurrent,
            ..RateLimitConfig::default()
        })
    }

    fn client(addr: &str) -> ClientIdentity {
        ClientIdentity::from_address(addr)
    }

    #[test]
    fn exempt_prefixes_are_never_limited() {
        let admission = admission(1, 1);
        let local = client("127.0.0.1");
        let mut held = Vec::new();
        for _ in 0..10 {
            match admission.admit(&local) {
                Admission::Allow(permit) => held.push(permit),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(held.iter().all(Option::is_none));
    }

    #[test]
    fn request_after_limit_is_rate_limited() {
        let admission = admission(3, 0);
        let c = client("203.0.113.5");
        let now = Instant::now();
        for _ in 0..3 {
            assert!(matches!(admission.admit_at(&c, now), Admission::Allow(None)));
        }
        assert!(matches!(
            admission.admit_at(&c, now + Duration::from_secs(30)),
            Admission::RateLimited { retry_after: 60 }
        ));
        // Other clients are unaffected.
        assert!(matches!(
            admission.admit_at(&client("203.0.113.6"), now),
            Admission::Allow(_)
        ));
    }

    #[test]
    fn window_slides() {
        let admission = admission(2, 0);
        let c = client("203.0.113.5");
        let start = Instant::now();
        admission.admit_at(&c, start);
        admission.admit_at(&c, start + Duration::from_secs(10));
        assert!(matches!(
            admission.admit_at(&c, start + Duration::from_secs(59)),
            Admission::RateLimited { .. }
        ));
        assert!(matches!(
            admission.admit_at(&c, start + Duration::from_secs(61)),
            Admission::Allow(_)
        ));
    }

    #[test]
    fn concurrency_cap_and_release() {
        let admission = admission(0, 2);
        let c = client("198.51.100.7");

        let Admission::Allow(first) = admission.admit(&c) else {
            panic!("first should be admitted");
        };
        let Admission::Allow(_second) = admission.admit(&c) else {
            panic!("second should be admitted");
        };
        assert!(matches!(admission.admit(&c), Admission::ConcurrencyLimited));

        drop(first);
        assert_eq!(admission.in_flight("198.51.100.7"), 1);
        assert!(matches!(admission.admit(&c), Admission::Allow(Some(_))));
    }

    #[test]
    fn slot_entry_removed_at_zero() {
        let admission = admission(0, 5);
        let c = client("198.51.100.8");
        let permit = admission.admit(&c);
        drop(permit);
        assert!(lock_recovering(&admission.state).slots.is_empty());
    }

    #[test]
    fn zero_limits_disable_checks() {
        let admission = admission(0, 0);
        let c = client("198.51.100.9");
        for _ in 0..100 {
            assert!(matches!(admission.admit(&c), Admission::Allow(None)));
        }
    }

    #[test]
    fn sweep_evicts_stale_windows_and_expired_slots() {
        let admission = admission(10, 10);
        let now = Instant::now();
        let leaked = admission.admit_at(&client("192.0.2.1"), now);
        std::mem::forget(leaked);

        assert_eq!(admission.sweep_at(now + Duration::from_secs(1)), 0);
        // Window empty after 60 s, slot expired after slot_ttl (600 s).
        assert_eq!(admission.sweep_at(now + Duration::from_secs(601)), 2);
    }

    #[test]
    fn permit_outliving_a_sweep_does_not_release_a_newer_slot() {
        let admission = admission(0, 1);
        let c = client("192.0.2.9");
        let now = Instant::now();

        let Admission::Allow(old) = admission.admit_at(&c, now) else {
            panic!("first should be admitted");
        };
        // A stream open past slot_ttl has its slot swept.
        assert_eq!(admission.sweep_at(now + Duration::from_secs(601)), 1);
        let Admission::Allow(_current) = admission.admit_at(&c, now + Duration::from_secs(602))
        else {
            panic!("slot was swept, so a new request is admitted");
        };

        drop(old);
        assert_eq!(admission.in_flight("192.0.2.9"), 1);
        assert!(matches!(
            admission.admit_at(&c, now + Duration::from_secs(603)),
            Admission::ConcurrencyLimited
        ));
    }

    #[test]
    fn forwarded_for_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(headers::FORWARDED_FOR, "203.0.113.1, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "10.0.0.2:4000".parse().unwrap();

        assert_eq!(
            ClientIdentity::from_request(&headers, Some(peer), true).address,
            "203.0.113.1"
        );
        assert_eq!(
            ClientIdentity::from_request(&headers, Some(peer), false).address,
            "10.0.0.2"
        );
    }
}
