//! Service lifecycle: wires the store, transport and membership engine
//! together and runs the periodic maintenance loop.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::KvConfig,
    error::{KvError, KvResult},
    join::{fast_join, join_in_batches, join_members_with_retries, HostResolver, SeedResolver},
    kv::Kv,
    membership::{Member, Memberlist, MemberlistConfig, NodeSelectionDelegate, SelectAll},
    metrics::TransportMetrics,
    transport::{TcpTransport, Transport},
    zone::ZoneAwareNodeSelection,
};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A running node: store, transport and membership engine.
pub struct KvService {
    cfg: KvConfig,
    name: String,
    advertise_addr: SocketAddr,
    kv: Arc<Kv>,
    memberlist: Arc<Memberlist>,
    transport: Arc<TcpTransport>,
    resolver: Arc<dyn SeedResolver>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for KvService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvService")
            .field("name", &self.name)
            .field("advertise_addr", &self.advertise_addr)
            .finish_non_exhaustive()
    }
}

impl KvService {
    /// Starts a node, resolving seeds through DNS.
    pub async fn start(cfg: KvConfig) -> KvResult<Arc<Self>> {
        let resolver = Arc::new(HostResolver {
            default_port: cfg.tcp_transport.bind_port,
        });
        Self::start_with_resolver(cfg, resolver).await
    }

    pub async fn start_with_resolver(
        cfg: KvConfig,
        resolver: Arc<dyn SeedResolver>,
    ) -> KvResult<Arc<Self>> {
        cfg.validate()?;
        let name = cfg.effective_node_name();
        let kv = Arc::new(Kv::new(&cfg)?);

        let (transport, channels) = TcpTransport::bind(cfg.tcp_transport.clone()).await?;
        let advertise_addr = match transport
            .final_advertise_addr(cfg.advertise_addr.as_deref(), cfg.advertise_port)
        {
            Ok(addr) => addr,
            Err(e) => {
                let _ = transport.shutdown().await;
                return Err(e.into());
            }
        };

        let selector: Arc<dyn NodeSelectionDelegate> = if cfg.zone_aware_routing.enabled {
            Arc::new(ZoneAwareNodeSelection::new(
                cfg.zone_aware_routing.zone.clone(),
                cfg.zone_aware_routing.role,
            ))
        } else {
            Arc::new(SelectAll)
        };
        let memberlist = Memberlist::create(
            MemberlistConfig::from_kv_config(&cfg, name.clone(), advertise_addr),
            transport.clone(),
            channels,
            Arc::new(kv.attach()),
            selector,
        );

        let (shutdown_tx, _) = watch::channel(false);
        let service = Arc::new(Self {
            cfg,
            name,
            advertise_addr,
            kv,
            memberlist,
            transport,
            resolver,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        if let Err(e) = service.join_on_startup().await {
            error!(name = %service.name, error = %e, "Failed to join cluster, stopping");
            if let Err(stop_err) = service.stop().await {
                warn!(error = %stop_err, "Error while stopping after failed join");
            }
            return Err(e);
        }

        let run = tokio::spawn(service.clone().run());
        service.tasks.lock().push(run);
        info!(name = %service.name, addr = %service.advertise_addr, "KV service started");
        Ok(service)
    }

    async fn join_on_startup(self: &Arc<Self>) -> KvResult<()> {
        if self.cfg.join_members.is_empty() {
            info!("No join members configured, starting a new cluster");
            return Ok(());
        }

        let reached = fast_join(self.memberlist.as_ref(), self.resolver.as_ref(), &self.cfg).await;
        if reached == 0 {
            if self.cfg.abort_if_fast_join_fails {
                return Err(KvError::Join("fast join reached no members".to_string()));
            }
            warn!("Fast join reached no members");
        }

        if self.cfg.abort_if_join_fails {
            join_members_with_retries(self.memberlist.as_ref(), self.resolver.as_ref(), &self.cfg)
                .await?;
            return Ok(());
        }

        let service = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => {}
                result = join_members_with_retries(
                    service.memberlist.as_ref(),
                    service.resolver.as_ref(),
                    &service.cfg,
                ) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Background join failed");
                    }
                }
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    #[instrument(fields(name = %self.name), skip(self))]
    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut rejoin = if self.cfg.join_members.is_empty() {
            None
        } else {
            optional_interval(self.cfg.rejoin_interval)
        };
        let mut cleanup = optional_interval(self.cfg.obsolete_entries_timeout);
        let mut flush = optional_interval(self.cfg.notify_interval);

        loop {
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => {
                    debug!("Service loop shutting down");
                    break;
                }
                _ = tick(&mut rejoin) => {
                    match join_in_batches(
                        self.memberlist.as_ref(),
                        self.resolver.as_ref(),
                        &self.cfg.join_members,
                    )
                    .await
                    {
                        Ok(reached) => debug!(reached, "Rejoined members"),
                        Err(e) => warn!(error = %e, "Rejoin failed"),
                    }
                }
                _ = tick(&mut cleanup) => {
                    self.kv.cleanup_obsolete_entries();
                }
                _ = tick(&mut flush) => {
                    self.kv.flush_pending_notifications();
                }
            }
        }
    }

    /// Leaves the cluster and shuts everything down. Local updates still in
    /// the broadcast queue get a bounded chance to go out first.
    pub async fn stop(&self) -> KvResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(name = %self.name, "Stopping KV service");
        self.kv.set_stopping();

        if self.memberlist.num_members() > 1 {
            let deadline = Instant::now() + self.cfg.broadcast_timeout_for_local_updates_on_shutdown;
            while self.kv.local_broadcasts_pending() > 0 && Instant::now() < deadline {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
            let pending = self.kv.local_broadcasts_pending();
            if pending > 0 {
                warn!(pending, "Local updates not broadcast before shutdown");
            }
        }

        if let Err(e) = self.memberlist.leave(self.cfg.leave_timeout).await {
            warn!(error = %e, "Failed to leave cluster cleanly");
        }

        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Service task failed during shutdown");
            }
        }

        self.memberlist.shutdown().await?;
        self.kv.shutdown();
        info!(name = %self.name, "KV service stopped");
        Ok(())
    }

    pub fn kv(&self) -> Arc<Kv> {
        self.kv.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise_addr
    }

    pub fn members(&self) -> Vec<Member> {
        self.memberlist.members()
    }

    pub fn num_members(&self) -> usize {
        self.memberlist.num_members()
    }

    pub fn transport_metrics(&self) -> Arc<TransportMetrics> {
        self.transport.metrics()
    }
}

fn optional_interval(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

enum InitState {
    Uninitialized,
    Starting,
    Running(Arc<KvService>),
    Failed(String),
}

/// Lazily starts one shared [`KvService`] on first use.
pub struct KvInitService {
    cfg: KvConfig,
    resolver: Option<Arc<dyn SeedResolver>>,
    state: tokio::sync::Mutex<InitState>,
}

impl std::fmt::Debug for KvInitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvInitService")
            .field("cfg", &self.cfg)
            .finish_non_exhaustive()
    }
}

impl KvInitService {
    pub fn new(cfg: KvConfig) -> Self {
        Self {
            cfg,
            resolver: None,
            state: tokio::sync::Mutex::new(InitState::Uninitialized),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SeedResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Returns the shared store, starting the service on the first call.
    /// A failed start is remembered and returned to every later caller.
    pub async fn get_kv(&self) -> KvResult<Arc<Kv>> {
        self.get_service().await.map(|service| service.kv())
    }

    pub async fn get_service(&self) -> KvResult<Arc<KvService>> {
        let mut state = self.state.lock().await;
        match &*state {
            InitState::Running(service) => return Ok(service.clone()),
            InitState::Failed(reason) => return Err(KvError::StartFailed(reason.clone())),
            InitState::Starting | InitState::Uninitialized => {}
        }

        *state = InitState::Starting;
        let started = match &self.resolver {
            Some(resolver) => KvService::start_with_resolver(self.cfg.clone(), resolver.clone()).await,
            None => KvService::start(self.cfg.clone()).await,
        };
        match started {
            Ok(service) => {
                *state = InitState::Running(service.clone());
                Ok(service)
            }
            Err(e) => {
                error!(error = %e, "KV service failed to start");
                *state = InitState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Stops the service if it is running.
    pub async fn stop(&self) -> KvResult<()> {
        let mut state = self.state.lock().await;
        if let InitState::Running(service) = &*state {
            service.stop().await?;
            *state = InitState::Uninitialized;
        }
        Ok(())
    }
}
