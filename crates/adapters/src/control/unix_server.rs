use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use application::control_service_impl::{ControlReply, ControlService};
use domain::common::entity::Caller;
use domain::common::error::DomainError;
use infrastructure::constants::CONTROL_READ_TIMEOUT;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use super::framing::{read_payload, read_request_header, write_response};

/// Socket file mode. Authorization is by peer uid, not file access.
const SOCKET_MODE: u32 = 0o666;

/// Decides whether a peer uid holds the administrative capability.
pub type AdminPolicy = Arc<dyn Fn(u32) -> bool + Send + Sync>;

/// Bind the control socket, replacing a stale socket file.
pub fn bind_control_socket(path: &Path) -> io::Result<UnixListener> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(
        path,
        std::os::unix::fs::PermissionsExt::from_mode(SOCKET_MODE),
    )?;
    Ok(listener)
}

/// Accept control connections until `cancel` fires, then remove the socket
/// file. Each connection may carry any number of requests.
pub async fn run_control_server(
    listener: UnixListener,
    socket_path: PathBuf,
    control: Arc<ControlService>,
    admin: AdminPolicy,
    cancel: CancellationToken,
) {
    tracing::info!(path = %socket_path.display(), "control socket listening");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let control = Arc::clone(&control);
                    let admin = Arc::clone(&admin);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &control, &admin, &cancel).await {
                            tracing::debug!(error = %e, "control connection closed with error");
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "control accept failed"),
            },
        }
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!(path = %socket_path.display(), error = %e, "control socket already removed");
    }
    tracing::info!("control socket stopped");
}

async fn handle_connection(
    stream: UnixStream,
    control: &ControlService,
    admin: &AdminPolicy,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let uid = stream.peer_cred()?.uid();
    let caller = Caller::new(uid, admin(uid));
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let header = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            read = read_request_header(&mut reader) => match read {
                Ok(Some(header)) => header,
                Ok(None) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    let reply = ControlReply::error(&DomainError::InvalidArgument(e.to_string()));
                    write_response(&mut writer, reply.status, &reply.payload).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
        };

        // An oversized payload is never read; the stream cannot be
        // resynchronised afterwards.
        if header.check_ceilings().is_err() {
            let reply = control.handle(&caller, &header, &[]).await;
            write_response(&mut writer, reply.status, &reply.payload).await?;
            return Ok(());
        }

        let payload = tokio::time::timeout(
            CONTROL_READ_TIMEOUT,
            read_payload(&mut reader, header.payload_len as usize),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "control payload read timed out"))??;

        let reply = control.handle(&caller, &header, &payload).await;
        write_response(&mut writer, reply.status, &reply.payload).await?;
    }
}
