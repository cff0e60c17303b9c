use std::path::Path;

use adapters::control::framing::{read_response, write_request};
use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use domain::common::error::DomainError;
use ipvs_common::frame::RequestHeader;
use ipvs_common::sockopt::{GetCommand, SetCommand, VERSION_REPLY_LEN};
use ipvs_common::user::{
    DaemonUser, DefenseEntry, DefenseUser, DestEntry, DestUser, GetDestsHeader,
    GetServicesHeader, InfoReply, ServiceEntry, ServiceUser, TimeoutsUser, Wire, decode_entries,
};
use tokio::net::UnixStream;

/// Client for the daemon's Unix control socket.
///
/// One connection carries every request of a CLI invocation.
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("failed to connect to control socket {}", path.display()))?;
        Ok(Self { stream })
    }

    async fn call(&mut self, header: RequestHeader, payload: &[u8]) -> Result<Bytes> {
        write_request(&mut self.stream, &header, payload)
            .await
            .context("failed to send control request")?;
        let (status, reply) = read_response(&mut self.stream)
            .await
            .context("failed to read control reply")?;
        if status < 0 {
            return Err(anyhow!(DomainError::from_errno(
                status.saturating_neg(),
                format!("command {} rejected", header.cmd)
            )));
        }
        Ok(reply)
    }

    async fn set(&mut self, cmd: SetCommand, payload: &[u8]) -> Result<()> {
        self.call(RequestHeader::set(cmd, payload.len()), payload)
            .await
            .with_context(|| cmd.name())?;
        Ok(())
    }

    async fn get(&mut self, cmd: GetCommand, payload: &[u8], capacity: usize) -> Result<Bytes> {
        self.call(RequestHeader::get(cmd, payload.len(), capacity), payload)
            .await
            .with_context(|| cmd.name())
    }

    // ── Get ─────────────────────────────────────────────────────────

    pub async fn version(&mut self) -> Result<String> {
        let reply = self.get(GetCommand::Version, &[], VERSION_REPLY_LEN).await?;
        let end = reply.iter().position(|&b| b == 0).unwrap_or(reply.len());
        Ok(String::from_utf8_lossy(&reply[..end]).into_owned())
    }

    pub async fn info(&mut self) -> Result<InfoReply> {
        let reply = self.get(GetCommand::Info, &[], InfoReply::SIZE).await?;
        Ok(InfoReply::from_slice(&reply)?)
    }

    /// List up to the service count reported by a preceding `Info`.
    pub async fn services(&mut self) -> Result<Vec<ServiceEntry>> {
        let n = self.info().await?.num_services as usize;
        let req = GetServicesHeader {
            num_services: u32::try_from(n)?,
        };
        let reply = self
            .get(
                GetCommand::Services,
                &req.to_bytes(),
                GetServicesHeader::reply_len(n),
            )
            .await?;
        let mut buf = &reply[..];
        let header = GetServicesHeader::decode(&mut buf)?;
        Ok(decode_entries(&mut buf, header.num_services as usize)?)
    }

    pub async fn service(&mut self, selector: &ServiceUser) -> Result<ServiceEntry> {
        let req = ServiceEntry {
            service: *selector,
            ..ServiceEntry::default()
        };
        let reply = self
            .get(GetCommand::Service, &req.to_bytes(), ServiceEntry::SIZE)
            .await?;
        Ok(ServiceEntry::from_slice(&reply)?)
    }

    /// List the destinations of `entry`, sized by its `num_dests`.
    pub async fn dests(&mut self, entry: &ServiceEntry) -> Result<Vec<DestEntry>> {
        let n = entry.num_dests as usize;
        let req = GetDestsHeader {
            protocol: entry.service.protocol,
            port: entry.service.port,
            addr: entry.service.addr,
            fwmark: entry.service.fwmark,
            num_dests: entry.num_dests,
        };
        let reply = self
            .get(GetCommand::Dests, &req.to_bytes(), GetDestsHeader::reply_len(n))
            .await?;
        let mut buf = &reply[..];
        let header = GetDestsHeader::decode(&mut buf)?;
        Ok(decode_entries(&mut buf, header.num_dests as usize)?)
    }

    pub async fn timeouts(&mut self) -> Result<TimeoutsUser> {
        let reply = self
            .get(GetCommand::Timeouts, &[], TimeoutsUser::SIZE)
            .await?;
        Ok(TimeoutsUser::from_slice(&reply)?)
    }

    /// Master and backup daemon entries, in that order.
    pub async fn daemons(&mut self) -> Result<(DaemonUser, DaemonUser)> {
        let reply = self
            .get(GetCommand::Daemon, &[], 2 * DaemonUser::SIZE)
            .await?;
        if reply.len() != 2 * DaemonUser::SIZE {
            bail!("daemon status reply has {} bytes", reply.len());
        }
        let mut buf = &reply[..];
        let master = DaemonUser::decode(&mut buf)?;
        let backup = DaemonUser::decode(&mut buf)?;
        Ok((master, backup))
    }

    pub async fn defense(&mut self) -> Result<DefenseEntry> {
        let reply = self
            .get(GetCommand::Defense, &[], DefenseEntry::SIZE)
            .await?;
        Ok(DefenseEntry::from_slice(&reply)?)
    }

    // ── Set ─────────────────────────────────────────────────────────

    pub async fn add_service(&mut self, svc: &ServiceUser) -> Result<()> {
        self.set(SetCommand::AddService, &svc.to_bytes()).await
    }

    pub async fn edit_service(&mut self, svc: &ServiceUser) -> Result<()> {
        self.set(SetCommand::EditService, &svc.to_bytes()).await
    }

    pub async fn del_service(&mut self, selector: &ServiceUser) -> Result<()> {
        self.set(SetCommand::DelService, &selector.to_bytes()).await
    }

    pub async fn add_dest(&mut self, selector: &ServiceUser, dest: &DestUser) -> Result<()> {
        self.set(SetCommand::AddDest, &dest_payload(selector, dest))
            .await
    }

    pub async fn edit_dest(&mut self, selector: &ServiceUser, dest: &DestUser) -> Result<()> {
        self.set(SetCommand::EditDest, &dest_payload(selector, dest))
            .await
    }

    pub async fn del_dest(&mut self, selector: &ServiceUser, dest: &DestUser) -> Result<()> {
        self.set(SetCommand::DelDest, &dest_payload(selector, dest))
            .await
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.set(SetCommand::Flush, &[]).await
    }

    /// Zero one service's counters, or everything for an empty selector.
    pub async fn zero(&mut self, selector: &ServiceUser) -> Result<()> {
        self.set(SetCommand::Zero, &selector.to_bytes()).await
    }

    pub async fn set_timeouts(&mut self, t: &TimeoutsUser) -> Result<()> {
        self.set(SetCommand::Timeouts, &t.to_bytes()).await
    }

    pub async fn start_daemon(&mut self, d: &DaemonUser) -> Result<()> {
        self.set(SetCommand::StartDaemon, &d.to_bytes()).await
    }

    pub async fn stop_daemons(&mut self) -> Result<()> {
        self.set(SetCommand::StopDaemon, &[]).await
    }

    pub async fn set_defense(&mut self, d: &DefenseUser) -> Result<()> {
        self.set(SetCommand::Defense, &d.to_bytes()).await
    }
}

fn dest_payload(selector: &ServiceUser, dest: &DestUser) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ServiceUser::SIZE + DestUser::SIZE);
    payload.extend_from_slice(&selector.to_bytes());
    payload.extend_from_slice(&dest.to_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    use adapters::control::unix_server::{bind_control_socket, run_control_server};
    use application::control_service_impl::ControlService;
    use application::defense_service_impl::DefenseAppService;
    use application::ipvs_service_impl::IpvsAppService;
    use domain::defense::entity::DefenseTunables;
    use domain::defense::timeouts::ConnTimeouts;
    use domain::ipvs::table::ServiceTable;
    use ipvs_common::user::encode_name;
    use ports::test_utils::{FixedMemory, NoopMetrics};
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct Daemon {
        _dir: tempfile::TempDir,
        path: std::path::PathBuf,
        cancel: CancellationToken,
    }

    fn spawn_daemon(admin: bool) -> Daemon {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let cancel = CancellationToken::new();
        let ipvs = Arc::new(IpvsAppService::new(
            ServiceTable::default(),
            Arc::new(NoopMetrics),
        ));
        let defense = Arc::new(DefenseAppService::new(
            DefenseTunables::default(),
            ConnTimeouts::default(),
            Arc::new(FixedMemory::new(1 << 20)),
            Arc::new(NoopMetrics),
        ));
        let control = Arc::new(ControlService::new(
            ipvs,
            defense,
            Arc::new(NoopMetrics),
            4096,
            cancel.clone(),
        ));
        let listener = bind_control_socket(&path).unwrap();
        tokio::spawn(run_control_server(
            listener,
            path.clone(),
            control,
            Arc::new(move |_: u32| admin),
            cancel.clone(),
        ));
        Daemon {
            _dir: dir,
            path,
            cancel,
        }
    }

    fn web() -> ServiceUser {
        ServiceUser {
            protocol: 6,
            port: 80,
            addr: Ipv4Addr::new(10, 0, 0, 1),
            sched_name: encode_name("rr").unwrap(),
            ..ServiceUser::default()
        }
    }

    fn backend(last: u8) -> DestUser {
        DestUser {
            addr: Ipv4Addr::new(192, 168, 1, last),
            port: 8080,
            conn_flags: 0,
            weight: 1,
        }
    }

    #[tokio::test]
    async fn service_and_dest_lifecycle() {
        let d = spawn_daemon(true);
        let mut client = ControlClient::connect(&d.path).await.unwrap();

        client.add_service(&web()).await.unwrap();
        client.add_dest(&web(), &backend(10)).await.unwrap();
        client.add_dest(&web(), &backend(11)).await.unwrap();

        let services = client.services().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].num_dests, 2);

        let dests = client.dests(&services[0]).await.unwrap();
        assert_eq!(dests.len(), 2);

        client.del_dest(&web(), &backend(10)).await.unwrap();
        let entry = client.service(&web()).await.unwrap();
        assert_eq!(entry.num_dests, 1);

        client.flush().await.unwrap();
        assert!(client.services().await.unwrap().is_empty());
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn errors_carry_the_domain_kind() {
        let d = spawn_daemon(true);
        let mut client = ControlClient::connect(&d.path).await.unwrap();
        client.add_service(&web()).await.unwrap();

        let err = client.add_service(&web()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DomainError>(),
            Some(DomainError::AlreadyExists(_))
        ));

        client.del_service(&web()).await.unwrap();
        let err = client.service(&web()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DomainError>(),
            Some(DomainError::NotFound(_))
        ));
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn non_admin_is_denied() {
        let d = spawn_daemon(false);
        let mut client = ControlClient::connect(&d.path).await.unwrap();
        let err = client.flush().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DomainError>(),
            Some(DomainError::PermissionDenied(_))
        ));
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn version_and_info() {
        let d = spawn_daemon(true);
        let mut client = ControlClient::connect(&d.path).await.unwrap();
        let version = client.version().await.unwrap();
        assert!(version.starts_with("IP Virtual Server version"));
        let info = client.info().await.unwrap();
        assert_eq!(info.conn_tab_size, 4096);
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn daemons_and_defense() {
        let d = spawn_daemon(true);
        let mut client = ControlClient::connect(&d.path).await.unwrap();

        client
            .start_daemon(&DaemonUser {
                state: ipvs_common::user::DAEMON_STATE_BACKUP,
                mcast_ifn: encode_name("eth1").unwrap(),
                syncid: 3,
            })
            .await
            .unwrap();
        let (master, backup) = client.daemons().await.unwrap();
        assert_eq!(master.state, 0);
        assert_eq!(backup.syncid, 3);
        client.stop_daemons().await.unwrap();

        client
            .set_defense(&DefenseUser {
                amemthresh: 2048,
                ..DefenseUser::default()
            })
            .await
            .unwrap();
        assert_eq!(client.defense().await.unwrap().tunables.amemthresh, 2048);
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn missing_socket_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ControlClient::connect(&dir.path().join("none.sock"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("control socket"));
    }
}
