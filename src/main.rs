use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedSender};

use session_relay::config::Config;
use session_relay::events::{init_logging, AdapterCommand, SessionEvent};
use session_relay::hub::RpcHub;
use session_relay::registry::Registry;
use session_relay::router::Router;
use session_relay::settings::Settings;
use session_relay::supervisor::Supervisor;
use session_relay::threads::ThreadMappings;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(&config.log_level)?;

    let paths = config.paths();
    std::fs::create_dir_all(&paths.config_dir)
        .with_context(|| format!("failed creating {}", paths.config_dir.display()))?;

    let settings = Settings::load(&paths.settings)?;
    let registry = Arc::new(Registry::open(paths.registry.clone())?);
    let threads = Arc::new(ThreadMappings::open(paths.threads.clone()));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<SessionEvent>();

    {
        let tx = events_tx.clone();
        registry.set_on_status_change(Box::new(move |session, old| {
            let _ = tx.send(SessionEvent::StatusChange {
                session_id: session.id.clone(),
                old,
                new: session.status,
            });
        }));
    }

    let hub = RpcHub::new(paths.socket.clone());
    let router = Router::new(
        registry.clone(),
        threads.clone(),
        hub.clone(),
        events_tx.clone(),
    );
    let supervisor = Arc::new(Supervisor::new(
        registry,
        threads,
        settings,
        paths.socket.clone(),
        config.runner.clone(),
        paths.log_root.clone(),
        events_tx.clone(),
    ));

    // Sessions that did not survive the previous daemon run get their
    // "lost" notices out before any runner can reconnect.
    supervisor.reconcile_at_startup();

    // Adapter-facing event stream: NDJSON on stdout.
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                use std::io::Write;
                let mut stdout = std::io::stdout().lock();
                let _ = stdout.write_all(line.as_bytes());
                let _ = stdout.write_all(b"\n");
                let _ = stdout.flush();
            }
        }
    });

    {
        let hub = hub.clone();
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(error) = hub.run(router).await {
                tracing::error!(target = "session_relay", error = %error, "rpc hub exited");
            }
        });
    }

    tokio::spawn(supervisor.clone().run_health_loop(hub.clone()));

    let mut adapter_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut shutdown = false;

    while !shutdown {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                shutdown = true;
            }

            _ = sigterm.recv() => {
                tracing::info!(target = "session_relay", "received SIGTERM, shutting down");
                shutdown = true;
            }

            line = adapter_lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        match handle_command(&line, &router, &supervisor, &events_tx).await {
                            Ok(should_shutdown) => {
                                if should_shutdown {
                                    shutdown = true;
                                }
                            }
                            Err(error) => {
                                let _ = events_tx.send(SessionEvent::CommandError {
                                    message: error.to_string(),
                                });
                            }
                        }
                    }
                    Ok(None) => {
                        shutdown = true;
                    }
                    Err(error) => {
                        tracing::error!(target = "session_relay", error = %error, "stdin read failed");
                        shutdown = true;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn handle_command(
    line: &str,
    router: &Arc<Router>,
    supervisor: &Arc<Supervisor>,
    events_tx: &UnboundedSender<SessionEvent>,
) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(false);
    }
    let command: AdapterCommand =
        serde_json::from_str(line).context("failed parsing adapter command")?;

    match command {
        AdapterCommand::StartSession {
            cwd,
            command,
            terminal,
        } => {
            supervisor
                .start_session(cwd.map(PathBuf::from), command, terminal)
                .await?;
        }
        AdapterCommand::StopSession { session_id, force } => {
            supervisor.stop_session(&session_id, force).await?;
        }
        AdapterCommand::ListSessions {} => {
            let _ = events_tx.send(SessionEvent::Sessions {
                sessions: router.list_sessions(),
            });
        }
        AdapterCommand::SendInput { session_id, text } => {
            router.send_input(&session_id, &text)?;
        }
        AdapterCommand::PermissionDecision {
            request_id,
            decision,
        } => {
            router.send_permission_decision(&request_id, decision);
        }
        AdapterCommand::AskUserAnswer {
            session_id,
            question_index,
            answer,
        } => {
            router.record_ask_user_answer(&session_id, question_index, &answer);
        }
        AdapterCommand::AskUserToggle {
            session_id,
            question_index,
            option,
        } => {
            router.record_ask_user_toggle(&session_id, question_index, &option);
        }
        AdapterCommand::AskUserCommit {
            session_id,
            question_index,
        } => {
            router.commit_ask_user_draft(&session_id, question_index);
        }
        AdapterCommand::AskUserAnswers {
            session_id,
            answers,
        } => {
            router.allow_pending_ask_user_question(&session_id, &answers);
        }
        AdapterCommand::SetYolo {
            session_id,
            enabled,
        } => {
            router.set_yolo(&session_id, enabled);
        }
        AdapterCommand::BindThread {
            session_id,
            thread_id,
            channel_id,
        } => {
            router.bind_thread(&session_id, &thread_id, &channel_id);
        }
        AdapterCommand::Shutdown {} => {
            return Ok(true);
        }
    }
    Ok(false)
}
