//! DevClaw binary: composition root and CLI entry point.
//!
//! Wires every capability handle (access, pairing, tools, providers,
//! failover, sessions, team, scheduler, notifications, hooks, metrics,
//! memory indexer) from [`devclaw::config::Config`] and starts the
//! background loops (scheduler ticker, metrics ticker, memory indexer
//! ticker). Inbound message transports are external collaborators (see
//! the crate-level overview) — this binary runs the always-on
//! coordination subsystem and exposes `pair` subcommands for
//! administering onboarding out of band.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use uuid::Uuid;

use devclaw::access::{AccessManager, DefaultPolicy};
use devclaw::agent::budget::{DailyBudget, SessionBudget};
use devclaw::agent::{AgentProfile, AgentRun, CancellationToken, RunRequest};
use devclaw::audit::AuditLog;
use devclaw::channel::{ChannelSink, RecordingChannelSink};
use devclaw::config::{self, Config};
use devclaw::credentials::{self, Credentials};
use devclaw::db::Store;
use devclaw::failover::ModelFailover;
use devclaw::hooks::{HookManager, WebhookEndpoint};
use devclaw::memory_indexer::MemoryIndexer;
use devclaw::metrics::MetricsCollector;
use devclaw::notification::NotificationDispatcher;
use devclaw::pairing::PairingManager;
use devclaw::providers::anthropic::AnthropicProvider;
use devclaw::providers::ollama::OllamaProvider;
use devclaw::providers::LlmProvider;
use devclaw::scheduler::{JobCommand, JobHandler, Scheduler};
use devclaw::session::SessionStore;
use devclaw::team::{TeamManager, TeamMemory};
use devclaw::tools::builtin::{HttpGetTool, ListDirTool, ReadFileTool, ShellExecTool, WriteFileTool};
use devclaw::tools::executor::ToolRouter;
use devclaw::tools::team_tools::build_team_tool_handlers;
use devclaw::tools::ToolHandler;
use devclaw::types::{AccessLevel, Channel, PairingRole, SessionKey};

/// Environment variable naming the owner identity (always [`AccessLevel::Owner`]).
const OWNER_JID_ENV: &str = "DEVCLAW_OWNER_JID";

/// Default owner JID used when the environment variable is unset, matching
/// the default config's permissive-local-dev posture.
const DEFAULT_OWNER_JID: &str = "owner@local";

/// Webhook URL for lifecycle-event delivery (C16), if configured.
const WEBHOOK_URL_ENV: &str = "DEVCLAW_WEBHOOK_URL";

/// HMAC signing secret for the configured webhook, if any.
const WEBHOOK_SECRET_ENV: &str = "DEVCLAW_WEBHOOK_SECRET";

/// Fixed delay between webhook delivery retries.
const WEBHOOK_RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Parser)]
#[command(name = "devclaw", version, about = "Multi-channel agent runtime core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the always-on coordination subsystem: scheduler, metrics,
    /// memory indexing, and crash recovery. Blocks until SIGINT.
    Start,
    /// Administer pairing tokens and requests out of band.
    Pair(PairArgs),
}

#[derive(Debug, Args)]
struct PairArgs {
    #[command(subcommand)]
    action: PairAction,
}

#[derive(Debug, Subcommand)]
enum PairAction {
    /// Mint a new shareable pairing token.
    New {
        /// Access level granted on redemption.
        #[arg(long, value_enum, default_value = "user")]
        role: PairRole,
        /// Number of redemptions allowed, or 0 for unlimited.
        #[arg(long, default_value_t = 1)]
        max_uses: u32,
        /// Grant access immediately on redemption instead of queuing an
        /// approval request.
        #[arg(long)]
        auto_approve: bool,
        /// Team workspace to assign the redeemer to.
        #[arg(long)]
        workspace: Option<String>,
        /// Free-form note stored alongside the token.
        #[arg(long)]
        note: Option<String>,
    },
    /// Approve a pending pairing request.
    Approve {
        /// Request id to approve.
        request_id: Uuid,
        /// Access level to grant.
        #[arg(long, value_enum, default_value = "user")]
        role: PairRole,
    },
    /// Deny a pending pairing request.
    Deny {
        /// Request id to deny.
        request_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum PairRole {
    /// Grants [`AccessLevel::User`].
    User,
    /// Grants [`AccessLevel::Admin`].
    Admin,
}

impl From<PairRole> for PairingRole {
    fn from(role: PairRole) -> Self {
        match role {
            PairRole::User => Self::User,
            PairRole::Admin => Self::Admin,
        }
    }
}

impl From<PairRole> for AccessLevel {
    fn from(role: PairRole) -> Self {
        PairingRole::from(role).access_level()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;

    match cli.command {
        Command::Start => runtime.block_on(run_start()),
        Command::Pair(args) => {
            devclaw::logging::init_cli();
            runtime.block_on(run_pair(args))
        }
    }
}

/// Deferred [`JobHandler`] that forwards to a [`TeamManager`] set after
/// construction. Breaks the `Scheduler` ↔ `TeamManager` construction cycle
/// (the scheduler takes its handler before the team manager that needs the
/// scheduler can be built) without giving the team manager a scheduler
/// callback of its own — the scheduler still only ever sees an opaque
/// [`JobCommand`] (spec §9's "avoid embedding scheduler callbacks inside
/// the team manager").
///
/// On fire, it resolves the agent id out of the opaque command, drains the
/// agent's mailbox and working state through the bound [`TeamManager`], and
/// re-enters the Agent Run loop under that agent's own profile — the "fires
/// an opaque command; the team manager registers a command handler that
/// resolves agent ID and invokes Agent Run" pattern from the design notes.
struct HeartbeatDispatcher {
    team: OnceLock<Arc<TeamManager>>,
    team_memory: Arc<TeamMemory>,
    sessions: Arc<SessionStore>,
    audit: Arc<AuditLog>,
    failover: Arc<ModelFailover>,
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    metrics: Arc<MetricsCollector>,
    channel_sink: Arc<dyn ChannelSink>,
    budget_config: devclaw::config::BudgetConfig,
    session_budget: Arc<SessionBudget>,
    workspace: std::path::PathBuf,
}

impl HeartbeatDispatcher {
    #[allow(clippy::too_many_arguments)]
    fn new(
        team_memory: Arc<TeamMemory>,
        sessions: Arc<SessionStore>,
        audit: Arc<AuditLog>,
        failover: Arc<ModelFailover>,
        providers: HashMap<String, Arc<dyn LlmProvider>>,
        metrics: Arc<MetricsCollector>,
        channel_sink: Arc<dyn ChannelSink>,
        budget_config: devclaw::config::BudgetConfig,
        session_budget: Arc<SessionBudget>,
        workspace: std::path::PathBuf,
    ) -> Self {
        Self {
            team: OnceLock::new(),
            team_memory,
            sessions,
            audit,
            failover,
            providers,
            metrics,
            channel_sink,
            budget_config,
            session_budget,
            workspace,
        }
    }

    fn bind(&self, team: Arc<TeamManager>) {
        let _ = self.team.set(team);
    }

    /// Build the per-heartbeat tool surface: the same base filesystem/HTTP
    /// tools every run gets, plus `group:team` scoped to this agent.
    fn build_tool_router(&self, team_id: &str, agent_id: &str) -> Arc<ToolRouter> {
        let agent_workspace = self.workspace.join(agent_id);
        let _ = std::fs::create_dir_all(&agent_workspace);
        let mut handlers: Vec<Box<dyn ToolHandler>> = vec![
            Box::new(ReadFileTool::new(agent_workspace.clone())),
            Box::new(WriteFileTool::new(agent_workspace.clone())),
            Box::new(ListDirTool::new(agent_workspace.clone())),
            Box::new(HttpGetTool::new()),
        ];
        handlers.extend(build_team_tool_handlers(
            team_id,
            agent_id,
            Arc::clone(&self.team_memory),
            self.team
                .get()
                .expect("team manager bound before any heartbeat fires")
                .clone(),
        ));
        Arc::new(ToolRouter::new(handlers, Arc::clone(&self.audit)))
    }

    async fn run_agent_heartbeat(&self, agent_id: &str) -> anyhow::Result<()> {
        let team = self
            .team
            .get()
            .ok_or_else(|| anyhow::anyhow!("heartbeat fired before team manager was bound"))?;
        let agent = team
            .get_agent(agent_id)?
            .ok_or_else(|| anyhow::anyhow!("heartbeat agent {agent_id:?} not found"))?;
        let pending = team.run_heartbeat(agent_id)?;
        let working_state = team.working_state(agent_id)?;

        let mut prompt = String::from(
            "Heartbeat: review your working state and any pending messages, then make progress.\n",
        );
        match &working_state {
            Some(state) => {
                prompt.push_str(&format!(
                    "\nCurrent status: {}\nNext steps: {}\nContext: {}\n",
                    state.status, state.next_steps, state.context
                ));
            }
            None => prompt.push_str("\nNo working state recorded yet.\n"),
        }
        if pending.is_empty() {
            prompt.push_str("\nNo pending mailbox messages.\n");
        } else {
            prompt.push_str("\nPending mailbox messages:\n");
            for message in &pending {
                let from = message
                    .from_agent
                    .as_deref()
                    .or(message.from_user.as_deref())
                    .unwrap_or("unknown");
                prompt.push_str(&format!("- from {from}: {}\n", message.content));
            }
        }

        let tool_router = self.build_tool_router(&agent.team_id, agent_id);
        let agent_run = AgentRun::new(
            Arc::clone(&self.sessions),
            tool_router,
            Arc::clone(&self.failover),
            self.providers.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&self.channel_sink),
            self.budget_config,
            Arc::clone(&self.session_budget),
        );

        let request = RunRequest {
            session_key: SessionKey::new(Channel::Cron, agent_id),
            user_message: prompt,
            profile: AgentProfile {
                instructions: agent.system_prompt.clone(),
                allowed_tools: Vec::new(),
                budget_override: None,
            },
            caller_level: AccessLevel::Admin,
        };
        agent_run.run(request, CancellationToken::new()).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for HeartbeatDispatcher {
    async fn handle(&self, command: &JobCommand) -> anyhow::Result<()> {
        if command.kind != "agent_heartbeat" {
            return Ok(());
        }
        let agent_id = command
            .payload
            .get("agent_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("agent_heartbeat command missing agent_id"))?
            .to_owned();
        self.run_agent_heartbeat(&agent_id).await
    }
}

async fn run_start() -> Result<()> {
    let paths = config::runtime_paths()?;
    let logs_dir = paths
        .database
        .parent()
        .map(|dir| dir.join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let _logging_guard = devclaw::logging::init_production(&logs_dir)?;

    info!("devclaw starting");

    let config = config::load().context("failed to load configuration")?;
    let credentials = load_credentials(&config)?;

    let store = Arc::new(Store::open(&config.paths.database).with_context(|| {
        format!(
            "failed to open database at {}",
            config.paths.database.display()
        )
    })?);

    let owner_jid = std::env::var(OWNER_JID_ENV).unwrap_or_else(|_| DEFAULT_OWNER_JID.to_owned());
    let owner = SessionKey::new(Channel::Cron, owner_jid);

    let mut access_mgr = AccessManager::new(
        Arc::clone(&store),
        DefaultPolicy::parse(&config.access.default_policy),
        owner,
    );
    access_mgr
        .seed_config(&config.access)
        .context("failed to seed config-defined access sets")?;
    let access = Arc::new(access_mgr);
    let _pairing = Arc::new(PairingManager::new(
        Arc::clone(&store),
        Arc::clone(&access),
        config.pairing.token_ttl_secs,
    ));

    let audit = Arc::new(AuditLog::new(Arc::clone(&store)));
    let workspace = config.paths.config_dir.join("workspace");
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("failed to create workspace dir {}", workspace.display()))?;

    let handlers: Vec<Box<dyn ToolHandler>> = vec![
        Box::new(ReadFileTool::new(workspace.clone())),
        Box::new(WriteFileTool::new(workspace.clone())),
        Box::new(ListDirTool::new(workspace.clone())),
        Box::new(HttpGetTool::new()),
        Box::new(ShellExecTool::new(workspace.clone())),
    ];
    let tool_router = Arc::new(ToolRouter::with_auto_approve(
        handlers,
        Arc::clone(&audit),
        config.tools.auto_approve.iter().cloned().collect(),
    ));

    let metrics = Arc::new(MetricsCollector::new());
    let failover = Arc::new(ModelFailover::new(&config.models, Arc::clone(&store)));
    let providers = build_providers(&config, &credentials);

    let sessions = Arc::new(SessionStore::new(Arc::clone(&store)));
    let channel_sink: Arc<dyn ChannelSink> = Arc::new(RecordingChannelSink::new());
    let daily_budget = Arc::new(DailyBudget::new(config.budget.max_tokens_per_day));
    let session_budget = Arc::new(SessionBudget::new(daily_budget, config.budget));

    let agent_run = Arc::new(AgentRun::new(
        Arc::clone(&sessions),
        Arc::clone(&tool_router),
        Arc::clone(&failover),
        providers.clone(),
        Arc::clone(&metrics),
        Arc::clone(&channel_sink),
        config.budget,
        Arc::clone(&session_budget),
    ));

    let recovered = agent_run
        .recover_interrupted_runs()
        .await
        .context("failed to recover interrupted runs")?;
    if recovered > 0 {
        info!(count = recovered, "recovered interrupted runs from prior process");
    }

    let team_memory = Arc::new(TeamMemory::new(Arc::clone(&store)));
    let dispatcher = Arc::new(HeartbeatDispatcher::new(
        Arc::clone(&team_memory),
        Arc::clone(&sessions),
        Arc::clone(&audit),
        Arc::clone(&failover),
        providers,
        Arc::clone(&metrics),
        Arc::clone(&channel_sink),
        config.budget,
        Arc::clone(&session_budget),
        workspace.join("agents"),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&dispatcher) as Arc<dyn JobHandler>,
    ));
    let team_manager = Arc::new(TeamManager::new(
        Arc::clone(&store),
        Arc::clone(&team_memory),
        Arc::clone(&scheduler),
    ));
    dispatcher.bind(Arc::clone(&team_manager));

    let hooks = build_hook_manager(&config, Arc::clone(&store));
    let _notifications = Arc::new(NotificationDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&team_memory),
        Arc::clone(&channel_sink),
        hooks,
    ));

    let memory_root = config.paths.config_dir.join("memory");
    std::fs::create_dir_all(&memory_root)
        .with_context(|| format!("failed to create memory dir {}", memory_root.display()))?;
    let memory_indexer = Arc::new(MemoryIndexer::new(Arc::clone(&store), "default", memory_root));

    let _scheduler_ticker = Arc::clone(&scheduler).spawn_ticker();
    let _metrics_ticker = Arc::clone(&metrics).spawn_ticker(Duration::from_secs(60), None);
    let _indexer_ticker = Arc::clone(&memory_indexer).spawn_ticker(Duration::from_secs(300));

    info!("devclaw ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("devclaw shutting down");
    Ok(())
}

async fn run_pair(args: PairArgs) -> Result<()> {
    let config = config::load().context("failed to load configuration")?;
    let store = Arc::new(Store::open(&config.paths.database).with_context(|| {
        format!(
            "failed to open database at {}",
            config.paths.database.display()
        )
    })?);
    let owner_jid = std::env::var(OWNER_JID_ENV).unwrap_or_else(|_| DEFAULT_OWNER_JID.to_owned());
    let owner = SessionKey::new(Channel::Cron, owner_jid);
    let mut access_mgr = AccessManager::new(
        Arc::clone(&store),
        DefaultPolicy::parse(&config.access.default_policy),
        owner,
    );
    access_mgr
        .seed_config(&config.access)
        .context("failed to seed config-defined access sets")?;
    let access = Arc::new(access_mgr);
    let pairing = PairingManager::new(Arc::clone(&store), access, config.pairing.token_ttl_secs);

    match args.action {
        PairAction::New {
            role,
            max_uses,
            auto_approve,
            workspace,
            note,
        } => {
            let token = pairing.mint_token(
                Channel::Cron,
                role.into(),
                max_uses,
                auto_approve,
                workspace,
                note,
                None,
            )?;
            println!("{}", token.token);
        }
        PairAction::Approve { request_id, role } => {
            let session = pairing.approve(request_id, role.into())?;
            println!("approved {session}");
        }
        PairAction::Deny { request_id } => {
            let session = pairing.deny(request_id)?;
            println!("denied {session}");
        }
    }
    Ok(())
}

fn load_credentials(config: &Config) -> Result<Credentials> {
    let env_path = config.paths.config_dir.join(".env");
    if env_path.exists() {
        credentials::enforce_private_file_permissions(&env_path)?;
        credentials::load_credentials(&env_path)
    } else {
        Ok(Credentials::from_map(std::collections::BTreeMap::new()))
    }
}

fn build_hook_manager(config: &Config, store: Arc<Store>) -> Option<Arc<HookManager>> {
    let url = std::env::var(WEBHOOK_URL_ENV).ok()?;
    let secret = std::env::var(WEBHOOK_SECRET_ENV).ok();
    let endpoints = vec![WebhookEndpoint { url, secret }];
    Some(Arc::new(HookManager::new(
        store,
        endpoints,
        config.hooks.max_retries,
        Duration::from_millis(WEBHOOK_RETRY_DELAY_MS),
        Duration::from_secs(config.hooks.delivery_timeout_secs),
    )))
}

/// Build one concrete [`LlmProvider`] per model string Failover can select.
///
/// Model identifiers are `"<provider>/<model>"` (e.g.
/// `"anthropic/claude-sonnet-4"`, `"ollama/llama3"`); the prefix selects the
/// wire client, the remainder is passed through verbatim as the model name.
fn build_providers(
    config: &Config,
    credentials: &Credentials,
) -> HashMap<String, Arc<dyn LlmProvider>> {
    let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
    let anthropic_auth = credentials::resolve_anthropic_auth(credentials);

    let mut candidates = vec![config.models.primary.clone()];
    candidates.extend(config.models.fallbacks.iter().cloned());

    for model_id in candidates {
        if providers.contains_key(&model_id) {
            continue;
        }
        let Some((prefix, model_name)) = model_id.split_once('/') else {
            warn!(model = %model_id, "model id missing provider prefix, skipping");
            continue;
        };
        match prefix {
            "anthropic" => {
                let Some(auth) = anthropic_auth.clone() else {
                    warn!(model = %model_id, "no anthropic credentials configured, skipping");
                    continue;
                };
                providers.insert(
                    model_id.clone(),
                    Arc::new(AnthropicProvider::new(model_name, auth)),
                );
            }
            "ollama" => {
                providers.insert(model_id.clone(), Arc::new(OllamaProvider::new(model_name)));
            }
            other => {
                warn!(provider = other, model = %model_id, "unknown provider prefix, skipping");
            }
        }
    }
    providers
}
