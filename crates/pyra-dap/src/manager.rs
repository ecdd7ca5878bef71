use parking_lot::Mutex;
use pyra_config::{DebugConfig, InterpreterConfig, PyraConfig};
use pyra_process::{
    ExitInfo, ProcessEvent, ProcessHandle, RunEvents, RunRequest, Supervisor, SupervisorConfig,
    SupervisorError,
};

use crate::error::DebugResult;
use crate::launch::{self, LaunchRequest};
use crate::router::{EventRouter, RouterSender, Subscription, Topic};
use crate::session::DebugSession;

/// Supervisor settings derived from the `[interpreter]` config section.
pub fn supervisor_config(config: &InterpreterConfig) -> SupervisorConfig {
    SupervisorConfig {
        python: config.python.clone(),
        fallback_python: config.fallback_python.clone(),
        venv_dir: config.venv_dir.clone(),
        package_runner: config.package_runner.clone(),
        stop_grace: config.stop_grace(),
    }
}

/// Front door for the UI shell: plain runs, debug launches and the event
/// stream both of them feed.
///
/// Runs and debug launches share one [`Supervisor`], so at most one program
/// is alive at a time whichever way it was started.
pub struct ExecutionManager {
    supervisor: Supervisor,
    debug: DebugConfig,
    router: EventRouter,
    session: Mutex<Option<DebugSession>>,
}

impl ExecutionManager {
    pub fn new(supervisor: Supervisor, debug: DebugConfig) -> Self {
        Self {
            supervisor,
            debug,
            router: EventRouter::new(),
            session: Mutex::new(None),
        }
    }

    pub fn from_config(config: &PyraConfig) -> Self {
        Self::new(
            Supervisor::new(supervisor_config(&config.interpreter)),
            config.debug.clone(),
        )
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.router.subscribe(topic)
    }

    /// Start `request` without a debugger. Output goes to the router.
    pub async fn run(&self, request: RunRequest) -> Result<ProcessHandle, SupervisorError> {
        let (handle, events) = self.supervisor.start(request).await?;
        tokio::spawn(forward_run(events, self.router.sender()));
        Ok(handle)
    }

    /// Start `request` under the debugger; the session replaces any previous
    /// one.
    pub async fn launch(&self, request: LaunchRequest) -> DebugResult<DebugSession> {
        let launched =
            launch::launch(&self.supervisor, &self.debug, self.router.sender(), request).await?;
        *self.session.lock() = Some(launched.session.clone());
        Ok(launched.session)
    }

    /// Most recent debug session, terminated or not.
    pub fn session(&self) -> Option<DebugSession> {
        self.session.lock().clone()
    }

    /// End the current debug session as user-stopped, then stop the program.
    pub async fn stop(&self) -> Option<ExitInfo> {
        let session = self.session.lock().clone();
        if let Some(session) = session {
            if let Err(err) = session.disconnect().await {
                tracing::debug!(target: "pyra.manager", error = %err, "disconnect failed");
            }
        }
        self.supervisor.stop_current().await
    }
}

async fn forward_run(mut events: RunEvents, router: RouterSender) {
    let run = events.run_id();
    while let Some(event) = events.recv().await {
        let done = matches!(event, ProcessEvent::Completed(_));
        router.process(run, event);
        if done {
            break;
        }
    }
}
