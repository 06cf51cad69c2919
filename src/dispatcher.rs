//! The request dispatcher: the per-connection state machine that implements
//! the command protocol over the message channel, using the registry, ID
//! allocator, persistence facade and filter pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::{ChannelStream, MessageChannel};
use crate::error::{Error, Result};
use crate::filter::run_pipeline;
use crate::persistence::ResourceStatus;
use crate::protocol::{Command, Reply};
use crate::registry::{ClientId, ClientInfo, LivenessGuard};
use crate::server::graceful_shutdown;
use crate::state::AppState;
use crate::status::build_status;

/// Handles one accepted connection end to end.
pub struct Dispatcher<S> {
    channel: MessageChannel<S>,
    app: Arc<AppState>,
    peer_addr: SocketAddr,
    server_addr: SocketAddr,
    server_pid: i64,
    client_id: ClientId,
    client_name: Option<String>,
    /// Held for the lifetime of the connection once `GET_LOGIN` succeeds;
    /// dropping it (on any exit path) marks the client dead for
    /// `RM_CLIENT`/`SHUTDOWN` to observe.
    liveness: Option<LivenessGuard>,
}

impl<S: ChannelStream> Dispatcher<S> {
    pub fn new(
        channel: MessageChannel<S>,
        app: Arc<AppState>,
        peer_addr: SocketAddr,
        server_addr: SocketAddr,
        server_pid: i64,
    ) -> Self {
        Self {
            channel,
            app,
            peer_addr,
            server_addr,
            server_pid,
            client_id: 0,
            client_name: None,
            liveness: None,
        }
    }

    /// Run the per-connection state machine until peer close, a protocol
    /// terminal state, or an admin command ends the loop.
    #[tracing::instrument(skip_all, fields(client_id = self.client_id))]
    pub async fn run(mut self) -> Result<()> {
        loop {
            let command: Option<Command> = self.channel.recv().await?;
            let Some(command) = command else {
                debug!("peer closed connection");
                return Ok(());
            };

            debug!(?command, "received command");

            let keep_going = match command {
                Command::GetLogin { name, processid } => self.handle_get_login(name, processid).await?,
                Command::GetId => self.handle_get_id().await?,
                Command::DoneId {
                    resourceid,
                    responsecode,
                    annotation,
                } => self.handle_done_id(resourceid, responsecode, annotation).await?,
                Command::GetStatus => {
                    self.handle_get_status().await?;
                    false
                }
                Command::RmClient { clientid } => {
                    self.handle_rm_client(clientid).await?;
                    false
                }
                Command::Shutdown => {
                    self.handle_shutdown().await?;
                    false
                }
            };

            if !keep_going {
                return Ok(());
            }
        }
    }

    async fn handle_get_login(&mut self, name: String, processid: i64) -> Result<bool> {
        if self.client_id != 0 {
            return Err(Error::Protocol("GET_LOGIN received twice on one connection".into()));
        }

        let id = self.app.registry.allocate_id();
        let info = ClientInfo::new(name.clone(), self.peer_addr, processid);
        let (stop, guard) = self.app.registry.insert(id, info).await;
        let _ = stop; // re-fetched per GET_ID via the registry; kept alive via the table entry.

        self.client_id = id;
        self.client_name = Some(name);
        self.liveness = Some(guard);

        info!(client_id = id, "client logged in");
        self.channel.send(&Reply::GiveLogin { clientid: id }).await?;
        Ok(true)
    }

    async fn handle_get_id(&mut self) -> Result<bool> {
        self.require_login()?;

        let stop = self
            .app
            .registry
            .stop_signal(self.client_id)
            .await
            .ok_or_else(|| Error::Protocol("client record missing".into()))?;

        if stop.is_set() {
            self.channel.send(&Reply::Kill).await?;
            self.app.registry.remove_info(self.client_id).await;
            debug!(client_id = self.client_id, "killed by stop signal");
            return Ok(false);
        }

        let selected = {
            let _guard = self.app.selection_lock.lock().await;
            let selected = self
                .app
                .persistence
                .select_resource()
                .await
                .map_err(|e| Error::Backend(Box::new(e)))?;

            if let Some(selected) = &selected {
                self.app
                    .persistence
                    .update_resource(
                        &selected.id,
                        ResourceStatus::in_progress(),
                        None,
                        None,
                        self.client_name.clone(),
                    )
                    .await
                    .map_err(|e| Error::Backend(Box::new(e)))?;
            }
            selected
        };

        let Some(selected) = selected else {
            self.channel.send(&Reply::Finish).await?;
            let now_empty = self.app.registry.remove_info(self.client_id).await;
            if now_empty {
                info!("registry emptied by FINISH, triggering graceful shutdown");
                graceful_shutdown(&self.app, Some(self.client_id)).await;
            }
            return Ok(false);
        };

        self.app
            .registry
            .set_current_resource(self.client_id, Some(selected.id.clone()))
            .await;
        self.app.registry.increment_collected(self.client_id).await;

        let filters = run_pipeline(
            &selected.id,
            selected.response_code.as_deref(),
            selected.annotation.as_deref(),
            &self.app.parallel_filters,
            &self.app.sequential_filters,
        )
        .await
        .map_err(|e| Error::Filter {
            filter: "pipeline".into(),
            source: Box::new(e),
        })?;

        self.channel
            .send(&Reply::GiveId {
                resourceid: selected.id,
                filters,
            })
            .await?;
        Ok(true)
    }

    async fn handle_done_id(&mut self, resourceid: String, responsecode: String, annotation: String) -> Result<bool> {
        self.require_login()?;

        self.app
            .persistence
            .update_resource(
                &resourceid,
                ResourceStatus::succeeded(),
                Some(responsecode),
                Some(annotation),
                self.client_name.clone(),
            )
            .await
            .map_err(|e| Error::Backend(Box::new(e)))?;

        self.app.registry.set_current_resource(self.client_id, None).await;

        self.channel.send(&Reply::DidOk).await?;
        Ok(true)
    }

    async fn handle_get_status(&mut self) -> Result<()> {
        let snapshot = self.app.registry.snapshot().await;
        let total = self
            .app
            .persistence
            .total_resources_count()
            .await
            .map_err(|e| Error::Backend(Box::new(e)))?;
        let collected = self
            .app
            .persistence
            .resources_collected_count()
            .await
            .map_err(|e| Error::Backend(Box::new(e)))?;

        let status = build_status(self.server_addr, self.server_pid, snapshot, collected, total);
        self.channel.send(&Reply::GiveStatus { status }).await?;
        Ok(())
    }

    async fn handle_rm_client(&mut self, target: ClientId) -> Result<()> {
        if !self.app.registry.contains_control(target).await {
            self.channel
                .send(&Reply::RmError {
                    reason: format!("unknown client id {target}"),
                })
                .await?;
            return Ok(());
        }

        if self.app.registry.is_alive(target).await {
            warn!(target, "requesting stop and waiting for drain");
            self.app.registry.request_stop(target).await;
            self.app.registry.wait_until_dead(target).await;
        } else {
            self.reclaim(target).await?;
        }

        self.app.registry.remove(target).await;
        if self.app.registry.info_is_empty().await {
            info!("registry emptied by RM_CLIENT, triggering graceful shutdown");
            graceful_shutdown(&self.app, Some(self.client_id)).await;
        }

        self.channel.send(&Reply::RmOk).await?;
        Ok(())
    }

    async fn handle_shutdown(&mut self) -> Result<()> {
        info!("SHUTDOWN requested");
        graceful_shutdown(&self.app, Some(self.client_id)).await;
        self.channel.send(&Reply::SdOk).await?;
        Ok(())
    }

    /// Reclaim `target`'s in-flight resource to `AVAILABLE`, used on the
    /// `RM_CLIENT`/`SHUTDOWN` dead-worker path.
    async fn reclaim(&self, target: ClientId) -> Result<()> {
        if let Some(info) = self.app.registry.info_snapshot(target).await {
            if let Some(resource) = info.current_resource_id {
                self.app
                    .persistence
                    .update_resource(&resource, ResourceStatus::available(), None, None, Some(info.name))
                    .await
                    .map_err(|e| Error::Backend(Box::new(e)))?;
            }
        }
        Ok(())
    }

    fn require_login(&self) -> Result<()> {
        if self.client_id == 0 {
            return Err(Error::Protocol("command received before GET_LOGIN".into()));
        }
        Ok(())
    }
}

impl<S> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        if self.client_id != 0 {
            debug!(client_id = self.client_id, "dispatcher task ending");
        }
    }
}
