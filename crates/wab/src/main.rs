use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use wab_bridge::{BridgeConfig, BridgeTransport};
use wab_core::{
    admin::AdminOps,
    audit::AuditLogger,
    config::Config,
    console::{OperatorConsole, PresetPrompt, PromptSource, StdinPrompt, StdoutConsole},
    credentials::FileCredentialStore,
    router::{run_dispatch, CommandRouter},
    session::{SessionController, SessionOutcome},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wab_core::logging::init("wab")?;

    let cfg = Arc::new(Config::load().context("loading configuration")?);

    let transport = Arc::new(BridgeTransport::new(BridgeConfig::from_config(&cfg)));
    let store = Arc::new(FileCredentialStore::new(cfg.auth_dir.clone()));
    let console: Arc<dyn OperatorConsole> = Arc::new(StdoutConsole);
    let prompt: Box<dyn PromptSource> = match &cfg.pairing_number {
        Some(number) => Box::new(PresetPrompt(number.clone())),
        None => Box::new(StdinPrompt),
    };

    let audit = Arc::new(AuditLogger::new(cfg.audit_log_path.clone(), cfg.audit_log_json));
    let admin = AdminOps::new(cfg.user_domain.clone(), console.clone()).with_audit(audit.clone());
    let router = Arc::new(
        CommandRouter::new(cfg.group_suffix.clone(), admin, console.clone()).with_audit(audit),
    );

    let (mut controller, channels) =
        SessionController::new(cfg.clone(), transport, store, console, prompt);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("interrupt received; shutting down");
                    cancel.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "cannot listen for interrupts"),
            }
        });
    }

    let dispatch = tokio::spawn(run_dispatch(
        router,
        channels.inbound,
        channels.chat,
        cancel.clone(),
    ));

    let outcome = controller.run(cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = dispatch.await {
        tracing::warn!(error = %e, "dispatch task failed");
    }

    match outcome.context("session failed")? {
        SessionOutcome::LoggedOut => tracing::info!("logged out; exiting"),
        SessionOutcome::Shutdown => tracing::info!("shutdown complete"),
        SessionOutcome::RetriesExhausted { attempts } => {
            anyhow::bail!("gave up reconnecting after {attempts} attempts");
        }
    }
    Ok(())
}
