//! Replica sizing.
//!
//! [`Autoscaler`] is the pure decision core: given the mean load it computes
//! the desired replica count and decides whether an intent may be issued now.
//! [`ScalingController`] samples the registry, drives the autoscaler on a
//! timer and carries intents out through the [`Orchestrator`].

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

use crate::config::{GatewayConfig, OrchestratorConfig, ScalingConfig, ScalingSignal};
use crate::observability::metrics;
use crate::registry::{BackendInstance, InstanceId, InstanceOrigin, InstanceRegistry};
use crate::resilience::ExponentialBackoff;
use crate::scaling::orchestrator::{Orchestrator, OrchestratorError};
use crate::scaling::window::LoadWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl ScaleDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleIntent {
    pub direction: ScaleDirection,
    pub count: usize,
    pub current: usize,
    pub desired: usize,
    /// Part of `count` that replaces evicted instances.
    pub replacing: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingPolicy {
    pub min_replicas: usize,
    pub max_replicas: usize,
    pub target_utilization: f64,
    pub cooldown: Duration,
    pub backoff: ExponentialBackoff,
}

impl ScalingPolicy {
    pub fn from_config(scaling: &ScalingConfig, orchestrator: &OrchestratorConfig) -> Self {
        Self {
            min_replicas: scaling.min_replicas,
            max_replicas: scaling.max_replicas,
            target_utilization: scaling.target_utilization,
            cooldown: scaling.cooldown(),
            backoff: ExponentialBackoff::from_millis(orchestrator.backoff_base_ms, orchestrator.backoff_max_ms),
        }
    }
}

/// `ceil(load / target_utilization)` clamped to `[min, max]`.
pub fn desired_replicas(load: f64, target_utilization: f64, min: usize, max: usize) -> usize {
    // The epsilon keeps exact multiples such as 1.4 / 0.7 from rounding up.
    let raw = (load / target_utilization - 1e-9).ceil();
    let raw = if raw.is_finite() && raw > 0.0 { raw as usize } else { 0 };
    raw.max(min).min(max)
}

/// Scale-down victims among orchestrator-managed instances: non-routable
/// first, then fewest active connections, ties by highest id.
pub fn choose_victims(instances: &[Arc<BackendInstance>], count: usize) -> Vec<InstanceId> {
    let mut candidates: Vec<&Arc<BackendInstance>> = instances
        .iter()
        .filter(|i| i.origin == InstanceOrigin::Discovered)
        .collect();
    candidates.sort_by(|a, b| {
        a.is_routable()
            .cmp(&b.is_routable())
            .then(a.active_connections().cmp(&b.active_connections()))
            .then(b.id.cmp(&a.id))
    });
    candidates.into_iter().take(count).map(|i| i.id.clone()).collect()
}

#[derive(Debug)]
pub struct Autoscaler {
    policy: ScalingPolicy,
    last_intent_at: Option<Instant>,
    hold_until: Option<Instant>,
    consecutive_failures: u32,
    pending_replacements: usize,
    last_desired: Option<usize>,
}

impl Autoscaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            last_intent_at: None,
            hold_until: None,
            consecutive_failures: 0,
            pending_replacements: 0,
            last_desired: None,
        }
    }

    pub fn set_policy(&mut self, policy: ScalingPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    /// Decide on an intent. `removable` bounds how many instances a
    /// scale-down may remove. Issuing an intent starts the cooldown.
    pub fn evaluate(
        &mut self,
        mean_load: Option<f64>,
        current: usize,
        removable: usize,
        now: Instant,
    ) -> Option<ScaleIntent> {
        let load = mean_load?;
        let policy = self.policy;
        let mut desired = desired_replicas(load, policy.target_utilization, policy.min_replicas, policy.max_replicas);
        if self.pending_replacements > 0 {
            desired = desired
                .max(current + self.pending_replacements)
                .min(policy.max_replicas);
        }
        self.last_desired = Some(desired);

        let intent = match desired.cmp(&current) {
            Ordering::Equal => {
                self.pending_replacements = 0;
                return None;
            }
            Ordering::Greater => {
                let count = desired - current;
                ScaleIntent {
                    direction: ScaleDirection::Up,
                    count,
                    current,
                    desired,
                    replacing: self.pending_replacements.min(count),
                }
            }
            Ordering::Less => {
                let count = (current - desired).min(removable);
                if count == 0 {
                    return None;
                }
                ScaleIntent {
                    direction: ScaleDirection::Down,
                    count,
                    current,
                    desired,
                    replacing: 0,
                }
            }
        };

        if self.cooldown_remaining(now) > Duration::ZERO || self.hold_remaining(now) > Duration::ZERO {
            return None;
        }

        self.last_intent_at = Some(now);
        Some(intent)
    }

    /// The orchestrator fulfilled `intent`, starting `fulfilled` instances on scale-up.
    pub fn record_success(&mut self, intent: &ScaleIntent, fulfilled: usize) {
        self.consecutive_failures = 0;
        self.hold_until = None;
        if intent.direction == ScaleDirection::Up {
            self.pending_replacements = self.pending_replacements.saturating_sub(fulfilled);
        }
    }

    /// Hold at the current scale for `backoff(consecutive_failures)`.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let hold = self.policy.backoff.delay(self.consecutive_failures);
        self.hold_until = Some(now + hold);
        hold
    }

    /// Queue one replacement. The queue never exceeds `max_replicas`.
    pub fn note_replacement(&mut self) {
        self.pending_replacements = (self.pending_replacements + 1).min(self.policy.max_replicas);
    }

    pub fn clear_replacements(&mut self) {
        self.pending_replacements = 0;
    }

    pub fn cooldown_remaining(&self, now: Instant) -> Duration {
        self.last_intent_at
            .map(|at| self.policy.cooldown.saturating_sub(now.saturating_duration_since(at)))
            .unwrap_or(Duration::ZERO)
    }

    pub fn hold_remaining(&self, now: Instant) -> Duration {
        self.hold_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn pending_replacements(&self) -> usize {
        self.pending_replacements
    }

    pub fn last_desired(&self) -> Option<usize> {
        self.last_desired
    }
}

#[derive(Debug, Clone)]
struct IntentRecord {
    intent: ScaleIntent,
    issued_at: Instant,
    error: Option<String>,
}

#[derive(Debug)]
struct ControllerState {
    autoscaler: Autoscaler,
    window: LoadWindow,
    last_intent: Option<IntentRecord>,
    /// Evicted orchestrator-managed instances not yet stopped.
    pending_release: Vec<InstanceId>,
}

/// Last intent as reported by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct LastIntent {
    #[serde(flatten)]
    pub intent: ScaleIntent,
    pub secs_ago: u64,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScalingStatus {
    pub enabled: bool,
    pub orchestrator: &'static str,
    pub signal: ScalingSignal,
    pub current_replicas: usize,
    pub desired_replicas: Option<usize>,
    pub min_replicas: usize,
    pub max_replicas: usize,
    pub target_utilization: f64,
    pub mean_load: Option<f64>,
    pub cooldown_remaining_secs: f64,
    pub hold_remaining_secs: f64,
    pub consecutive_failures: u32,
    pub pending_replacements: usize,
    pub last_intent: Option<LastIntent>,
}

pub struct ScalingController {
    registry: Arc<InstanceRegistry>,
    orchestrator: Arc<dyn Orchestrator>,
    config: Arc<ArcSwap<GatewayConfig>>,
    state: Mutex<ControllerState>,
    external_utilization: Mutex<Option<f64>>,
}

impl ScalingController {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        orchestrator: Arc<dyn Orchestrator>,
        config: Arc<ArcSwap<GatewayConfig>>,
    ) -> Self {
        let (policy, span) = {
            let config = config.load();
            (
                ScalingPolicy::from_config(&config.scaling, &config.orchestrator),
                config.scaling.evaluation_window(),
            )
        };
        Self {
            registry,
            orchestrator,
            config,
            state: Mutex::new(ControllerState {
                autoscaler: Autoscaler::new(policy),
                window: LoadWindow::new(span),
                last_intent: None,
                pending_release: Vec::new(),
            }),
            external_utilization: Mutex::new(None),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest utilization (0 to 1) from an external source, used by the `external` signal.
    pub fn report_utilization(&self, utilization: f64) {
        *self
            .external_utilization
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(utilization.max(0.0));
    }

    /// An instance was evicted. Orchestrator-managed instances are stopped
    /// right away; while scaling is enabled a replacement is requested on
    /// the next evaluation.
    pub async fn note_replacement(&self, instance: &BackendInstance) {
        if instance.origin == InstanceOrigin::Discovered {
            self.state().pending_release.push(instance.id.clone());
            self.release_evicted().await;
        }

        if !self.config.load().scaling.enabled {
            tracing::info!(instance = %instance.id, "Scaling disabled, evicted instance not replaced");
            return;
        }
        let mut state = self.state();
        state.autoscaler.note_replacement();
        tracing::info!(
            instance = %instance.id,
            pending = state.autoscaler.pending_replacements(),
            "Evicted instance queued for replacement"
        );
    }

    /// Ask the orchestrator to stop evicted instances. Releases that fail
    /// transiently stay queued and are retried before the next scale-up.
    async fn release_evicted(&self) {
        let ids = std::mem::take(&mut self.state().pending_release);
        if ids.is_empty() {
            return;
        }
        match self.orchestrator.scale_down(&ids).await {
            Ok(()) => {
                tracing::info!(instances = ?ids, "Released evicted instances");
            }
            Err(OrchestratorError::Rejected(reason)) => {
                tracing::warn!(instances = ?ids, reason = %reason, "Orchestrator refused to release evicted instances");
            }
            Err(e) => {
                tracing::warn!(instances = ?ids, error = %e, "Releasing evicted instances failed, will retry");
                self.state().pending_release.extend(ids);
            }
        }
    }

    pub fn pending_releases(&self) -> usize {
        self.state().pending_release.len()
    }

    /// Register the instances the orchestrator already runs. Returns how many were added.
    pub async fn discover(&self) -> usize {
        match self.orchestrator.list_instances().await {
            Ok(descriptors) => {
                let mut added = 0;
                for descriptor in descriptors {
                    if self.registry.get(&descriptor.id).is_err() {
                        self.registry.register(descriptor, InstanceOrigin::Discovered);
                        added += 1;
                    }
                }
                tracing::info!(orchestrator = self.orchestrator.name(), added, "Instance discovery finished");
                added
            }
            Err(e) => {
                tracing::warn!(orchestrator = self.orchestrator.name(), error = %e, "Instance discovery failed");
                0
            }
        }
    }

    pub async fn tick(&self) -> Option<ScaleIntent> {
        self.tick_at(Instant::now()).await
    }

    /// Take a load sample, evaluate, and carry out any resulting intent.
    pub async fn tick_at(&self, now: Instant) -> Option<ScaleIntent> {
        let config = self.config.load_full();
        let snapshot = self.registry.snapshot();
        let current = snapshot.len();
        let removable = snapshot
            .instances()
            .iter()
            .filter(|i| i.origin == InstanceOrigin::Discovered)
            .count();

        let sample = match config.scaling.signal {
            ScalingSignal::Connections => {
                Some(snapshot.total_active_connections() as f64 / config.scaling.replica_capacity)
            }
            ScalingSignal::External => self
                .external_utilization
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .map(|u| u * current as f64),
        };

        let intent = {
            let mut state = self.state();
            state
                .autoscaler
                .set_policy(ScalingPolicy::from_config(&config.scaling, &config.orchestrator));
            state.window.set_span(config.scaling.evaluation_window());
            if let Some(load) = sample {
                state.window.record(now, load);
            }
            let mean = state.window.mean(now);
            let intent = state.autoscaler.evaluate(mean, current, removable, now);
            metrics::set_replicas(current, state.autoscaler.last_desired().unwrap_or(current));
            intent
        }?;

        self.execute(&intent, now).await;
        Some(intent)
    }

    async fn execute(&self, intent: &ScaleIntent, now: Instant) {
        metrics::record_scale_intent(intent.direction.as_str());
        tracing::info!(
            direction = intent.direction.as_str(),
            count = intent.count,
            current = intent.current,
            desired = intent.desired,
            replacing = intent.replacing,
            "Issuing scale intent"
        );

        if intent.direction == ScaleDirection::Up {
            self.release_evicted().await;
        }

        let result = match intent.direction {
            ScaleDirection::Up => self.orchestrator.scale_up(intent.count).await.map(|descriptors| {
                let started = descriptors.len();
                for descriptor in descriptors {
                    self.registry.register(descriptor, InstanceOrigin::Discovered);
                }
                started
            }),
            ScaleDirection::Down => {
                let victims = choose_victims(self.registry.snapshot().instances(), intent.count);
                self.orchestrator.scale_down(&victims).await.map(|()| {
                    for id in &victims {
                        if self.registry.deregister(id).is_err() {
                            tracing::debug!(instance = %id, "Scale-down victim already deregistered");
                        }
                    }
                    victims.len()
                })
            }
        };

        let mut state = self.state();
        let error = match result {
            Ok(fulfilled) => {
                state.autoscaler.record_success(intent, fulfilled);
                tracing::info!(direction = intent.direction.as_str(), fulfilled, "Scale intent fulfilled");
                None
            }
            Err(e) => {
                let hold = state.autoscaler.record_failure(now);
                tracing::warn!(
                    direction = intent.direction.as_str(),
                    error = %e,
                    hold_secs = hold.as_secs_f64(),
                    failures = state.autoscaler.consecutive_failures(),
                    "Scale intent failed, holding at current scale"
                );
                Some(e.to_string())
            }
        };
        state.last_intent = Some(IntentRecord {
            intent: intent.clone(),
            issued_at: now,
            error,
        });
    }

    pub fn status(&self) -> ScalingStatus {
        let config = self.config.load();
        let now = Instant::now();
        let current = self.registry.len();
        let mut state = self.state();
        let mean_load = state.window.mean(now);
        let autoscaler = &state.autoscaler;
        ScalingStatus {
            enabled: config.scaling.enabled,
            orchestrator: self.orchestrator.name(),
            signal: config.scaling.signal,
            current_replicas: current,
            desired_replicas: autoscaler.last_desired(),
            min_replicas: config.scaling.min_replicas,
            max_replicas: config.scaling.max_replicas,
            target_utilization: config.scaling.target_utilization,
            mean_load,
            cooldown_remaining_secs: autoscaler.cooldown_remaining(now).as_secs_f64(),
            hold_remaining_secs: autoscaler.hold_remaining(now).as_secs_f64(),
            consecutive_failures: autoscaler.consecutive_failures(),
            pending_replacements: autoscaler.pending_replacements(),
            last_intent: state.last_intent.as_ref().map(|r| LastIntent {
                intent: r.intent.clone(),
                secs_ago: now.saturating_duration_since(r.issued_at).as_secs(),
                succeeded: r.error.is_none(),
                error: r.error.clone(),
            }),
        }
    }

    /// Evaluate every `evaluation_interval` until shutdown; instances
    /// arriving on `evictions` are released and queued for replacement.
    pub async fn run(
        self: Arc<Self>,
        mut evictions: mpsc::UnboundedReceiver<Arc<BackendInstance>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut period = self.config.load().scaling.evaluation_interval();
        let mut ticker = time::interval_at(time::Instant::now() + period, period);
        tracing::info!(
            interval_secs = period.as_secs(),
            orchestrator = self.orchestrator.name(),
            "Scaling controller starting"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let (enabled, configured) = {
                        let config = self.config.load();
                        (config.scaling.enabled, config.scaling.evaluation_interval())
                    };
                    if enabled {
                        self.tick().await;
                    } else {
                        self.state().autoscaler.clear_replacements();
                    }
                    if configured != period {
                        period = configured;
                        ticker = time::interval_at(time::Instant::now() + period, period);
                    }
                }
                Some(instance) = evictions.recv() => {
                    self.note_replacement(&instance).await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Scaling controller received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
