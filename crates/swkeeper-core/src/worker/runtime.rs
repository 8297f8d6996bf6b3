//! The worker event loop and the page-side handle used to reach it.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::lifecycle::LifecycleController;
use super::messages::{PageMessage, WorkerEvent};
use crate::cache::GenerationId;
use crate::error::{CacheError, FetchError, LifecycleError};
use crate::http::{Request, Response};

/// Buffer size for the page → worker command channel.
/// 32 is enough for a page's burst of asset requests on load with headroom.
const COMMAND_BUFFER_SIZE: usize = 32;

enum WorkerCommand {
    Message(PageMessage),
    Install {
        reply: oneshot::Sender<Result<GenerationId, LifecycleError>>,
    },
    Fetch {
        request: Request,
        reply: oneshot::Sender<Result<Response, FetchError>>,
    },
    CacheNames {
        reply: oneshot::Sender<Result<Vec<String>, CacheError>>,
    },
    ClearCaches {
        reply: oneshot::Sender<Result<usize, CacheError>>,
    },
}

/// The worker context: a single task owning the [`LifecycleController`].
///
/// Lifecycle commands run one at a time in arrival order, so an install always
/// completes before a later activation. Fetches are answered from spawned
/// tasks so slow network calls never stall the loop.
pub struct WorkerRuntime {
    controller: LifecycleController,
    commands: mpsc::Receiver<WorkerCommand>,
}

impl WorkerRuntime {
    /// Start the worker loop. It stops once every [`WorkerHandle`] is dropped.
    pub fn spawn(controller: LifecycleController) -> (WorkerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let handle = WorkerHandle {
            commands: tx,
            events: controller.event_sender(),
        };
        let runtime = Self {
            controller,
            commands: rx,
        };
        (handle, tokio::spawn(runtime.run()))
    }

    async fn run(mut self) {
        info!("Worker event loop started");
        while let Some(command) = self.commands.recv().await {
            match command {
                WorkerCommand::Message(message) => self.handle_message(message),
                WorkerCommand::Install { reply } => {
                    let result = self.controller.install().await;
                    let _ = reply.send(result);
                }
                WorkerCommand::Fetch { request, reply } => self.handle_fetch(request, reply),
                WorkerCommand::CacheNames { reply } => {
                    let _ = reply.send(self.controller.cache_names());
                }
                WorkerCommand::ClearCaches { reply } => {
                    let _ = reply.send(self.controller.clear_caches());
                }
            }
        }
        info!("Worker event loop stopped");
    }

    fn handle_message(&mut self, message: PageMessage) {
        debug!(kind = message.kind(), "Page message received");
        let result = match message {
            PageMessage::SkipWaiting => self.controller.skip_waiting(),
            PageMessage::ForceUpdate => self.controller.force_update(),
            PageMessage::VersionCheck { reply } => {
                let version = self.controller.version();
                if reply.send(WorkerEvent::VersionResponse { version }).is_err() {
                    debug!("Version check requester went away");
                }
                return;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "Page message failed");
        }
    }

    fn handle_fetch(&self, request: Request, reply: oneshot::Sender<Result<Response, FetchError>>) {
        if request.is_hard_refresh() {
            self.controller.hard_refresh();
        }

        match self.controller.interceptor() {
            Some(interceptor) => {
                tokio::spawn(async move {
                    let _ = reply.send(interceptor.handle(&request).await);
                });
            }
            None => {
                // Not controlling yet: plain network.
                let network = self.controller.network();
                tokio::spawn(async move {
                    let _ = reply.send(network.fetch(&request).await);
                });
            }
        }
    }
}

/// A page's connection to the worker. Clone freely; each clone may
/// [`subscribe`](WorkerHandle::subscribe) to worker events.
#[derive(Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<WorkerCommand>,
    events: broadcast::Sender<WorkerEvent>,
}

impl WorkerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub async fn post_message(&self, message: PageMessage) -> Result<(), LifecycleError> {
        self.commands
            .send(WorkerCommand::Message(message))
            .await
            .map_err(|_| LifecycleError::WorkerGone)
    }

    pub async fn install(&self) -> Result<GenerationId, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Install { reply })
            .await
            .map_err(|_| LifecycleError::WorkerGone)?;
        rx.await.map_err(|_| LifecycleError::WorkerGone)?
    }

    /// `VERSION_CHECK`: the active generation id, if any.
    pub async fn version_check(&self) -> Result<Option<String>, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.post_message(PageMessage::VersionCheck { reply }).await?;
        match rx.await.map_err(|_| LifecycleError::WorkerGone)? {
            WorkerEvent::VersionResponse { version } => Ok(version),
            other => Err(LifecycleError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub async fn fetch(&self, request: Request) -> Result<Response, FetchError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Fetch { request, reply })
            .await
            .map_err(|_| FetchError::WorkerStopped)?;
        rx.await.map_err(|_| FetchError::WorkerStopped)?
    }

    /// Names of every cache, for display and debugging.
    pub async fn cache_names(&self) -> Result<Vec<String>, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::CacheNames { reply })
            .await
            .map_err(|_| LifecycleError::WorkerGone)?;
        Ok(rx.await.map_err(|_| LifecycleError::WorkerGone)??)
    }

    /// Delete every cache of this app. Returns how many were removed.
    pub async fn clear_caches(&self) -> Result<usize, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::ClearCaches { reply })
            .await
            .map_err(|_| LifecycleError::WorkerGone)?;
        Ok(rx.await.map_err(|_| LifecycleError::WorkerGone)??)
    }
}
