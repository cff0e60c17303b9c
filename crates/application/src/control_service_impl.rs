use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use domain::common::entity::Caller;
use domain::common::error::DomainError;
use domain::ipvs::daemon::SyncDaemons;
use ipvs_common::frame::{Command, RequestHeader};
use ipvs_common::sockopt::{GetCommand, SetCommand, VERSION_CODE, VERSION_REPLY_LEN, version_triplet};
use ipvs_common::user::{
    DaemonUser, DefenseEntry, DefenseUser, DestEntry, DestUser, GetDestsHeader,
    GetServicesHeader, InfoReply, ServiceEntry, ServiceUser, TimeoutsUser, Wire,
};
use ports::secondary::metrics_port::MetricsPort;
use tokio::sync::MutexGuard;
use tokio_util::sync::CancellationToken;

use crate::defense_service_impl::DefenseAppService;
use crate::ipvs_service_impl::IpvsAppService;
use crate::wire_convert::{
    daemon_config, daemon_user, defense_entry, defense_update, dest_config, dest_entry, invalid,
    service_config, service_entry, service_key, timeouts_user, user_timeouts,
};

/// Outcome of one control request: zero or a negated errno, plus the reply
/// payload on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlReply {
    pub status: i32,
    pub payload: Bytes,
}

impl ControlReply {
    pub fn ok(payload: Bytes) -> Self {
        Self { status: 0, payload }
    }

    pub fn error(e: &DomainError) -> Self {
        Self {
            status: -e.errno(),
            payload: Bytes::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Administrative command dispatcher.
///
/// Requests are serialised by a single async lock. Waiting for it is
/// abandoned with `Interrupted` once the shutdown token fires.
pub struct ControlService {
    ipvs: Arc<IpvsAppService>,
    defense: Arc<DefenseAppService>,
    daemons: Mutex<SyncDaemons>,
    admin_lock: tokio::sync::Mutex<()>,
    metrics: Arc<dyn MetricsPort>,
    conn_tab_size: u32,
    shutdown: CancellationToken,
}

impl ControlService {
    pub fn new(
        ipvs: Arc<IpvsAppService>,
        defense: Arc<DefenseAppService>,
        metrics: Arc<dyn MetricsPort>,
        conn_tab_size: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ipvs,
            defense,
            daemons: Mutex::new(SyncDaemons::default()),
            admin_lock: tokio::sync::Mutex::new(()),
            metrics,
            conn_tab_size,
            shutdown,
        }
    }

    /// Handle one decoded request. Never fails: errors become a status.
    pub async fn handle(&self, caller: &Caller, header: &RequestHeader, payload: &[u8]) -> ControlReply {
        let start = Instant::now();
        let (name, result) = match header.command() {
            Ok(cmd) => (cmd.name(), self.handle_command(caller, cmd, header, payload).await),
            Err(e) => ("unknown", Err(invalid(e))),
        };
        let elapsed = start.elapsed().as_secs_f64();
        self.metrics.observe_control_duration(name, elapsed);

        match result {
            Ok(reply) => {
                self.metrics.record_control_request(name, "ok");
                tracing::debug!(command = name, uid = caller.uid, reply_len = reply.len(), "control request");
                ControlReply::ok(reply)
            }
            Err(e) => {
                self.metrics.record_control_request(name, e.kind());
                tracing::warn!(command = name, uid = caller.uid, cmd = header.cmd, error = %e, "control request failed");
                ControlReply::error(&e)
            }
        }
    }

    async fn handle_command(
        &self,
        caller: &Caller,
        cmd: Command,
        header: &RequestHeader,
        payload: &[u8],
    ) -> Result<Bytes, DomainError> {
        if !caller.admin {
            return Err(DomainError::PermissionDenied(format!(
                "uid {} lacks the administrative capability",
                caller.uid
            )));
        }
        header.check_ceilings().map_err(invalid)?;
        if payload.len() != cmd.arg_len() {
            return Err(invalid(format!(
                "{} expects {} payload bytes, got {}",
                cmd.name(),
                cmd.arg_len(),
                payload.len()
            )));
        }

        let _admin = self.lock_admin().await?;
        match cmd {
            Command::Set(c) => self.dispatch_set(c, payload).await.map(|()| Bytes::new()),
            Command::Get(c) => self.dispatch_get(c, payload, header.reply_capacity as usize),
        }
    }

    async fn lock_admin(&self) -> Result<MutexGuard<'_, ()>, DomainError> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => {
                Err(DomainError::Interrupted("control plane shutting down".to_string()))
            }
            guard = self.admin_lock.lock() => Ok(guard),
        }
    }

    /// Run a registry mutation off the async workers; it may block waiting
    /// for in-flight lookups to drain.
    async fn registry<T, F>(&self, f: F) -> Result<T, DomainError>
    where
        T: Send + 'static,
        F: FnOnce(&IpvsAppService) -> Result<T, DomainError> + Send + 'static,
    {
        let ipvs = Arc::clone(&self.ipvs);
        tokio::task::spawn_blocking(move || f(&ipvs))
            .await
            .map_err(|e| DomainError::Interrupted(e.to_string()))?
    }

    // ── Set commands ──────────────────────────────────────────────

    async fn dispatch_set(&self, cmd: SetCommand, payload: &[u8]) -> Result<(), DomainError> {
        match cmd {
            SetCommand::AddService => {
                let cfg = service_config(&decode::<ServiceUser>(payload)?)?;
                self.registry(move |r| r.add_service(&cfg)).await
            }
            SetCommand::EditService => {
                let cfg = service_config(&decode::<ServiceUser>(payload)?)?;
                self.registry(move |r| r.edit_service(&cfg)).await
            }
            SetCommand::DelService => {
                let key = service_key(&decode::<ServiceUser>(payload)?)?;
                self.registry(move |r| r.del_service(&key)).await
            }
            SetCommand::Flush => self.registry(IpvsAppService::flush).await,
            SetCommand::AddDest | SetCommand::EditDest | SetCommand::DelDest => {
                let (svc, dest) = payload.split_at(ServiceUser::SIZE);
                let key = service_key(&decode::<ServiceUser>(svc)?)?;
                let dest = decode::<DestUser>(dest)?;
                match cmd {
                    SetCommand::DelDest => {
                        self.registry(move |r| r.del_dest(&key, dest.addr, dest.port))
                            .await
                    }
                    SetCommand::EditDest => {
                        let cfg = dest_config(&dest)?;
                        self.registry(move |r| r.edit_dest(&key, &cfg)).await
                    }
                    _ => {
                        let cfg = dest_config(&dest)?;
                        self.registry(move |r| r.add_dest(&key, &cfg)).await
                    }
                }
            }
            SetCommand::Zero => {
                let selector = decode::<ServiceUser>(payload)?;
                if selector.is_empty_selector() {
                    self.registry(|r| r.zero(None)).await
                } else {
                    let key = service_key(&selector)?;
                    self.registry(move |r| r.zero(Some(&key))).await
                }
            }
            SetCommand::Timeouts => {
                let t = decode::<TimeoutsUser>(payload)?;
                self.defense.set_user_timeouts(user_timeouts(&t));
                Ok(())
            }
            SetCommand::StartDaemon => {
                let cfg = daemon_config(&decode::<DaemonUser>(payload)?)?;
                self.daemons_lock().start(cfg.clone())?;
                tracing::info!(
                    role = cfg.role.as_str(),
                    mcast_ifn = %cfg.mcast_ifn,
                    syncid = cfg.syncid,
                    "sync daemon started"
                );
                Ok(())
            }
            SetCommand::StopDaemon => {
                let stopped = self.daemons_lock().stop_all()?;
                for cfg in stopped {
                    tracing::info!(role = cfg.role.as_str(), "sync daemon stopped");
                }
                Ok(())
            }
            SetCommand::Defense => {
                let update = defense_update(&decode::<DefenseUser>(payload)?)?;
                self.defense.set_tunables(&update)?;
                Ok(())
            }
        }
    }

    fn daemons_lock(&self) -> std::sync::MutexGuard<'_, SyncDaemons> {
        self.daemons.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Get commands ──────────────────────────────────────────────

    fn dispatch_get(&self, cmd: GetCommand, payload: &[u8], capacity: usize) -> Result<Bytes, DomainError> {
        match cmd {
            GetCommand::Version => {
                require_capacity(cmd, capacity, VERSION_REPLY_LEN)?;
                Ok(self.version_reply())
            }
            GetCommand::Info => {
                require_capacity(cmd, capacity, InfoReply::SIZE)?;
                let info = InfoReply {
                    version: VERSION_CODE,
                    conn_tab_size: self.conn_tab_size,
                    num_services: u32::try_from(self.ipvs.num_services()).unwrap_or(u32::MAX),
                };
                Ok(info.to_bytes())
            }
            GetCommand::Services => {
                let req = decode::<GetServicesHeader>(payload)?;
                let n = req.num_services as usize;
                require_exact(cmd, capacity, GetServicesHeader::reply_len(n))?;
                let services = self.ipvs.services(n);
                let mut buf = BytesMut::with_capacity(GetServicesHeader::reply_len(services.len()));
                GetServicesHeader {
                    num_services: u32::try_from(services.len()).unwrap_or(u32::MAX),
                }
                .encode(&mut buf);
                for view in &services {
                    service_entry(view)?.encode(&mut buf);
                }
                Ok(buf.freeze())
            }
            GetCommand::Service => {
                require_capacity(cmd, capacity, ServiceEntry::SIZE)?;
                let req = decode::<ServiceEntry>(payload)?;
                let view = self.ipvs.get_service(&service_key(&req.service)?)?;
                Ok(service_entry(&view)?.to_bytes())
            }
            GetCommand::Dests => {
                let req = decode::<GetDestsHeader>(payload)?;
                let n = req.num_dests as usize;
                require_exact(cmd, capacity, GetDestsHeader::reply_len(n))?;
                let selector = ServiceUser {
                    protocol: req.protocol,
                    port: req.port,
                    addr: req.addr,
                    fwmark: req.fwmark,
                    ..ServiceUser::default()
                };
                let dests = self.ipvs.dests(&service_key(&selector)?, n)?;
                let mut buf = BytesMut::with_capacity(GetDestsHeader::reply_len(dests.len()));
                GetDestsHeader {
                    num_dests: u32::try_from(dests.len()).unwrap_or(u32::MAX),
                    ..req
                }
                .encode(&mut buf);
                for view in &dests {
                    dest_entry(view).encode(&mut buf);
                }
                Ok(buf.freeze())
            }
            GetCommand::Timeouts => {
                require_capacity(cmd, capacity, TimeoutsUser::SIZE)?;
                Ok(timeouts_user(&self.defense.user_timeouts()).to_bytes())
            }
            GetCommand::Daemon => {
                require_capacity(cmd, capacity, 2 * DaemonUser::SIZE)?;
                let daemons = self.daemons_lock();
                let mut buf = BytesMut::with_capacity(2 * DaemonUser::SIZE);
                daemon_user(daemons.master()).encode(&mut buf);
                daemon_user(daemons.backup()).encode(&mut buf);
                Ok(buf.freeze())
            }
            GetCommand::Defense => {
                require_capacity(cmd, capacity, DefenseEntry::SIZE)?;
                Ok(defense_entry(&self.defense.snapshot()).to_bytes())
            }
        }
    }

    fn version_reply(&self) -> Bytes {
        let text = format!(
            "IP Virtual Server version {} (size={})",
            version_triplet(VERSION_CODE),
            self.conn_tab_size
        );
        let mut buf = BytesMut::with_capacity(VERSION_REPLY_LEN);
        let raw = text.as_bytes();
        let len = raw.len().min(VERSION_REPLY_LEN - 1);
        buf.put_slice(&raw[..len]);
        buf.put_bytes(0, VERSION_REPLY_LEN - len);
        buf.freeze()
    }
}

fn decode<T: Wire>(payload: &[u8]) -> Result<T, DomainError> {
    T::from_slice(payload).map_err(invalid)
}

fn require_capacity(cmd: GetCommand, capacity: usize, need: usize) -> Result<(), DomainError> {
    if capacity < need {
        return Err(invalid(format!(
            "{} needs a {need}-byte reply buffer, got {capacity}",
            cmd.name()
        )));
    }
    Ok(())
}

fn require_exact(cmd: GetCommand, capacity: usize, want: usize) -> Result<(), DomainError> {
    if capacity != want {
        return Err(invalid(format!(
            "{} reply length must be exactly {want}, got {capacity}",
            cmd.name()
        )));
    }
    Ok(())
}
