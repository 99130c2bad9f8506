//! Event and reconciliation service
//!
//! Runs the log watcher and the periodic reconciliation loops until the
//! service moves to [`ServiceState::Exiting`], either through a fatal task
//! error or through [`ServiceHandle::terminate`].

use ipnet::IpNet;
use mailguard_common::config::{Config, ServiceConfig};
use mailguard_common::{Family, Result};
use mailguard_storage::EventSubscriber;
use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::patterns::FailurePatterns;
use crate::bans::BanCoordinator;

/// Normal termination
pub const EXIT_OK: i32 = 0;
/// Fatal condition, the supervisor should restart the service
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Running,
    Exiting,
}

struct Control {
    state: watch::Sender<ServiceState>,
    exit_code: AtomicI32,
    clear_before_exit: AtomicBool,
}

impl Control {
    fn new() -> Self {
        let (state, _) = watch::channel(ServiceState::Running);
        Self {
            state,
            exit_code: AtomicI32::new(EXIT_OK),
            clear_before_exit: AtomicBool::new(false),
        }
    }

    fn fail(&self) {
        self.exit_code.store(EXIT_FATAL, Ordering::SeqCst);
        self.state.send_replace(ServiceState::Exiting);
    }

    fn state(&self) -> ServiceState {
        *self.state.borrow()
    }
}

/// Wait until the service is exiting
async fn exiting(state: &mut watch::Receiver<ServiceState>) {
    loop {
        if *state.borrow_and_update() == ServiceState::Exiting {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `period`; returns true if the service started exiting
async fn sleep_or_exit(state: &mut watch::Receiver<ServiceState>, period: Duration) -> bool {
    tokio::select! {
        _ = exiting(state) => true,
        _ = tokio::time::sleep(period) => false,
    }
}

/// Handle used to stop a running service
#[derive(Clone)]
pub struct ServiceHandle {
    control: Arc<Control>,
}

impl ServiceHandle {
    /// Stop on a termination signal; the managed rules are cleared on exit
    pub fn terminate(&self) {
        info!("Termination requested");
        self.control.clear_before_exit.store(true, Ordering::SeqCst);
        self.control.state.send_replace(ServiceState::Exiting);
    }

    pub fn state(&self) -> ServiceState {
        self.control.state()
    }

    pub fn exit_code(&self) -> i32 {
        self.control.exit_code.load(Ordering::SeqCst)
    }
}

/// SNAT reconciliation target for one family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnatTarget {
    pub family: Family,
    pub target: IpAddr,
    pub source: IpNet,
}

/// Log watcher plus periodic reconciliation
pub struct NetfilterService {
    coordinator: Arc<BanCoordinator>,
    patterns: Arc<FailurePatterns>,
    config: ServiceConfig,
    snat: Vec<SnatTarget>,
    control: Arc<Control>,
}

impl NetfilterService {
    pub fn new(coordinator: Arc<BanCoordinator>, config: &Config) -> Result<Self> {
        let mut snat = Vec::new();
        if let Some(target) = config.snat.ipv4 {
            snat.push(SnatTarget {
                family: Family::Ip,
                target: IpAddr::V4(target),
                source: IpNet::V4(config.netfilter.ipv4_network),
            });
        }
        if let Some(target) = config.snat.ipv6 {
            snat.push(SnatTarget {
                family: Family::Ip6,
                target: IpAddr::V6(target),
                source: IpNet::V6(config.netfilter.ipv6_network),
            });
        }

        Ok(Self {
            coordinator,
            patterns: Arc::new(FailurePatterns::new()?),
            config: config.service.clone(),
            snat,
            control: Arc::new(Control::new()),
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            control: self.control.clone(),
        }
    }

    /// Run until exiting; returns the process exit code
    pub async fn run<S>(self, subscriber: S) -> i32
    where
        S: EventSubscriber + 'static,
    {
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        tasks.push((
            "watch",
            tokio::spawn(watch_events(
                subscriber,
                self.config.channel.clone(),
                self.coordinator.clone(),
                self.patterns.clone(),
                self.control.clone(),
            )),
        ));

        let coordinator = self.coordinator.clone();
        tasks.push((
            "chain_order",
            self.periodic("chain_order", self.config.chain_order_interval_secs, false, move || {
                let coordinator = coordinator.clone();
                async move { coordinator.chain_order().await }
            }),
        ));

        if self.coordinator.manages_firewall() {
            for snat in self.snat.clone() {
                let coordinator = self.coordinator.clone();
                tasks.push((
                    "snat",
                    self.periodic("snat", self.config.snat_interval_secs, false, move || {
                        let coordinator = coordinator.clone();
                        async move {
                            coordinator
                                .reconcile_snat(snat.family, snat.target, snat.source)
                                .await
                                .map(|_| ())
                        }
                    }),
                ));
            }
        }

        let coordinator = self.coordinator.clone();
        tasks.push((
            "autopurge",
            self.periodic("autopurge", self.config.autopurge_interval_secs, false, move || {
                let coordinator = coordinator.clone();
                async move { coordinator.autopurge().await }
            }),
        ));

        let coordinator = self.coordinator.clone();
        tasks.push((
            "blacklist",
            self.periodic("blacklist", self.config.list_refresh_interval_secs, true, move || {
                let coordinator = coordinator.clone();
                async move { coordinator.update_blacklist().await }
            }),
        ));

        let coordinator = self.coordinator.clone();
        tasks.push((
            "whitelist",
            self.periodic("whitelist", self.config.list_refresh_interval_secs, true, move || {
                let coordinator = coordinator.clone();
                async move { coordinator.update_whitelist().await }
            }),
        ));

        info!(tasks = tasks.len(), "Netfilter service running");

        exiting(&mut self.control.state.subscribe()).await;
        info!("Netfilter service exiting");

        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!(task = name, error = %e, "Task aborted");
                self.control.exit_code.store(EXIT_FATAL, Ordering::SeqCst);
            }
        }

        if self.control.clear_before_exit.load(Ordering::SeqCst) {
            if let Err(e) = self.coordinator.clear().await {
                error!(error = %e, "Failed to clear firewall rules before exit");
            }
        }

        let code = self.control.exit_code.load(Ordering::SeqCst);
        info!(exit_code = code, "Netfilter service stopped");
        code
    }

    /// Spawn a timed loop; a failure moves the service to exiting.
    ///
    /// Aligned loops run first and then sleep to the next multiple of the
    /// period counted from their start, so their cadence ignores processing
    /// time.
    fn periodic<F, Fut>(&self, name: &'static str, period_secs: u64, aligned: bool, mut task: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let control = self.control.clone();
        let period = Duration::from_secs(period_secs);

        tokio::spawn(async move {
            let mut state = control.state.subscribe();
            let origin = Instant::now();
            debug!(task = name, period_secs, "Periodic task started");

            loop {
                if !aligned && sleep_or_exit(&mut state, period).await {
                    break;
                }
                if control.state() == ServiceState::Exiting {
                    break;
                }

                if let Err(e) = task().await {
                    error!(task = name, error = %e, "Periodic task failed");
                    control.fail();
                    break;
                }

                if aligned {
                    let elapsed = origin.elapsed().as_nanos() % period.as_nanos().max(1);
                    let wait = period.saturating_sub(Duration::from_nanos(u64::try_from(elapsed).unwrap_or(0)));
                    if sleep_or_exit(&mut state, wait).await {
                        break;
                    }
                }
            }

            debug!(task = name, "Periodic task stopped");
        })
    }
}

async fn watch_events<S>(
    mut subscriber: S,
    channel: String,
    coordinator: Arc<BanCoordinator>,
    patterns: Arc<FailurePatterns>,
    control: Arc<Control>,
) where
    S: EventSubscriber,
{
    let mut state = control.state.subscribe();

    info!(channel = %channel, "Watching event channel");
    if let Err(e) = subscriber.subscribe(&channel).await {
        error!(error = %e, "Watch error");
        control.fail();
        return;
    }

    loop {
        let message = tokio::select! {
            _ = exiting(&mut state) => break,
            message = subscriber.next_message() => message,
        };

        match message {
            Ok(Some(line)) => {
                let Some(found) = patterns.match_line(&line) else {
                    continue;
                };
                warn!(
                    address = %found.address,
                    rule_id = found.rule_id,
                    service = found.service,
                    "{} matched rule id {} ({})",
                    found.address,
                    found.rule_id,
                    line
                );
                if let Err(e) = coordinator.ban(&found.address.to_string()).await {
                    error!(error = %e, "Watch error");
                    control.fail();
                    break;
                }
            }
            Ok(None) => {
                error!(channel = %channel, "Event subscription closed");
                control.fail();
                break;
            }
            Err(e) => {
                error!(error = %e, "Watch error");
                control.fail();
                break;
            }
        }
    }

    if let Err(e) = subscriber.unsubscribe().await {
        warn!(error = %e, "Failed to unsubscribe from event channel");
    }
}
