//! CLI binary for operating warden pipelines.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use warden_pipeline::{
    load_config, validate, EdgeFilter, NodePatch, NodeSpec, PipelineGraph, Scheduler, Severity,
    TransitionRequest, WardenConfig, Watcher, DEFAULT_CONFIG_FILE, SCHEDULER_INBOX,
};
use warden_types::{Actor, Evidence, NodeKind, NodeStatus, Role, WardenError};

#[derive(Parser)]
#[command(name = "warden", version, about = "Crash-recoverable task pipeline scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Identity recorded for this invocation
    #[arg(long, global = true, default_value = "operator")]
    actor: String,

    /// Role this invocation acts in
    #[arg(long, global = true, default_value = "operator")]
    role: Role,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a hand-written graph file as the first checkpoint
    Init {
        /// Path to the pipeline .dot file
        graph: PathBuf,
    },

    /// Add, remove or modify nodes
    #[command(subcommand)]
    Node(NodeCommand),

    /// Add, remove or list dependency edges
    #[command(subcommand)]
    Edge(EdgeCommand),

    /// Lint the graph file
    Validate {
        graph: PathBuf,
    },

    /// Show node statuses
    Status {
        graph: PathBuf,

        /// Only nodes in this status
        #[arg(long)]
        filter: Option<NodeStatus>,

        /// Only nodes whose dependencies are all validated
        #[arg(long)]
        deps_met: bool,
    },

    /// Move a node to a new status
    Transition {
        graph: PathBuf,
        node: String,
        status: NodeStatus,

        /// Refuse unless the node is currently in this status
        #[arg(long)]
        expect: Option<NodeStatus>,

        /// Evidence as JSON, or @path to a JSON file
        #[arg(long)]
        evidence: Option<String>,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Put a failed node back into active
    Retry {
        graph: PathBuf,
        node: String,
    },

    /// Stop dispatching and cancel active work
    Pause {
        graph: PathBuf,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Resume dispatching
    Resume {
        graph: PathBuf,
    },

    /// Report pipeline health
    Health {
        graph: PathBuf,
    },

    #[command(subcommand)]
    Checkpoint(CheckpointCommand),

    #[command(subcommand)]
    Audit(AuditCommand),

    #[command(subcommand)]
    Signal(SignalCommand),

    /// Consume signals and dispatch work until interrupted
    Watch {
        graph: PathBuf,

        /// Poll once and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand)]
enum NodeCommand {
    /// Add a node (task nodes get a paired gate unless --no-gate)
    Add(NodeAddArgs),

    /// Remove a node
    Remove {
        graph: PathBuf,
        id: String,

        /// Also remove its edges and its paired gate
        #[arg(long)]
        cascade: bool,
    },

    /// Change a node's attributes
    Modify {
        graph: PathBuf,
        id: String,

        /// key=value, repeatable
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Attribute to remove, repeatable
        #[arg(long = "unset", value_name = "KEY")]
        unset: Vec<String>,
    },
}

#[derive(Args)]
struct NodeAddArgs {
    graph: PathBuf,
    id: String,

    #[arg(long, default_value = "task")]
    kind: NodeKind,

    #[arg(long)]
    handler: Option<String>,

    /// Dependency, repeatable
    #[arg(long = "after", value_name = "NODE")]
    after: Vec<String>,

    #[arg(long)]
    max_retries: Option<u32>,

    #[arg(long)]
    ticket: Option<String>,

    /// Inbox that receives dispatches for this node
    #[arg(long = "dispatch-to")]
    dispatch_to: Option<String>,

    #[arg(long)]
    acceptance: Option<String>,

    /// Comma-separated file list
    #[arg(long)]
    files: Option<String>,

    #[arg(long)]
    gate_type: Option<String>,

    /// Extra metadata key=value, repeatable
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Do not create a paired gate
    #[arg(long)]
    no_gate: bool,
}

#[derive(Subcommand)]
enum EdgeCommand {
    Add {
        graph: PathBuf,
        from: String,
        to: String,

        #[arg(long)]
        label: Option<String>,

        /// Keep the edge even if it closes a cycle
        #[arg(long)]
        allow_cycle: bool,
    },
    Remove {
        graph: PathBuf,
        from: String,
        to: String,
    },
    List {
        graph: PathBuf,

        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: Option<String>,
    },
}

#[derive(Subcommand)]
enum CheckpointCommand {
    /// Re-import the edited graph file as a new checkpoint
    Save { graph: PathBuf },
    List { graph: PathBuf },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Check the hash chain end to end
    Verify { graph: PathBuf },
    Tail {
        graph: PathBuf,

        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },
    Summary { graph: PathBuf },
}

#[derive(Subcommand)]
enum SignalCommand {
    Send {
        graph: PathBuf,
        signal_type: String,

        /// Recipient inbox
        #[arg(long, default_value = SCHEDULER_INBOX)]
        to: String,

        /// Sender; defaults to --actor
        #[arg(long)]
        from: Option<String>,

        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
    },
    List {
        graph: PathBuf,

        /// Inbox to list; every participant when omitted
        participant: Option<String>,

        /// List consumed signals instead of pending ones
        #[arg(long)]
        processed: bool,
    },
}

/// Settings shared by every command.
struct Ctx {
    json: bool,
    actor: Actor,
    config: WardenConfig,
}

impl Ctx {
    fn scheduler(&self, graph: &Path) -> anyhow::Result<Scheduler> {
        Ok(Scheduler::open(graph, self.config.clone())?)
    }

    fn print<T: Serialize>(&self, value: &T, human: impl FnOnce()) -> anyhow::Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            human();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}

/// Exit status for a failed command: the error category's code, or 1.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<WardenError>()
        .map_or(1, WardenError::exit_code)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let ctx = Ctx {
        json: cli.json,
        actor: Actor::new(cli.actor, cli.role),
        config,
    };

    match cli.command {
        Commands::Init { graph } => cmd_init(&ctx, &graph),
        Commands::Node(cmd) => cmd_node(&ctx, cmd),
        Commands::Edge(cmd) => cmd_edge(&ctx, cmd),
        Commands::Validate { graph } => cmd_validate(&ctx, &graph),
        Commands::Status {
            graph,
            filter,
            deps_met,
        } => cmd_status(&ctx, &graph, filter, deps_met),
        Commands::Transition {
            graph,
            node,
            status,
            expect,
            evidence,
            reason,
        } => {
            let mut req = TransitionRequest::new(node, status, ctx.actor.clone());
            req.expected = expect;
            req.evidence = read_evidence(evidence.as_deref())?;
            req.reason = reason;
            let receipt = ctx.scheduler(&graph)?.transition(req)?;
            ctx.print(&receipt, || {
                println!(
                    "{}: {} -> {} (revision {}, checkpoint {})",
                    receipt.node, receipt.from, receipt.to, receipt.revision, receipt.checkpoint_seq
                )
            })
        }
        Commands::Retry { graph, node } => {
            let receipt = ctx.scheduler(&graph)?.retry(&node, ctx.actor.clone())?;
            ctx.print(&receipt, || {
                println!("{}: retrying (revision {})", receipt.node, receipt.revision)
            })
        }
        Commands::Pause { graph, reason } => {
            let outcome = ctx.scheduler(&graph)?.pause(&ctx.actor, reason)?;
            ctx.print(&outcome, || {
                if outcome.changed {
                    println!("paused; cancelled {} active node(s)", outcome.cancelled.len());
                } else {
                    println!("already paused");
                }
            })
        }
        Commands::Resume { graph } => {
            let outcome = ctx.scheduler(&graph)?.resume(&ctx.actor)?;
            ctx.print(&outcome, || {
                println!("{}", if outcome.changed { "resumed" } else { "not paused" })
            })
        }
        Commands::Health { graph } => {
            let report = ctx.scheduler(&graph)?.health()?;
            ctx.print(&report, || {
                println!("{}: {} ({})", report.pipeline, report.label, report.reason);
                println!(
                    "  nodes={} validated={} dispatchable={} blocked={} in_flight={} failed={} terminal={} max_retries_seen={}",
                    report.nodes,
                    report.validated,
                    report.dispatchable,
                    report.blocked,
                    report.in_flight,
                    report.failed,
                    report.terminal,
                    report.max_retries_seen
                );
            })
        }
        Commands::Checkpoint(cmd) => cmd_checkpoint(&ctx, cmd),
        Commands::Audit(cmd) => cmd_audit(&ctx, cmd),
        Commands::Signal(cmd) => cmd_signal(&ctx, cmd),
        Commands::Watch { graph, once } => cmd_watch(&ctx, &graph, once).await,
    }
}

fn read_evidence(arg: Option<&str>) -> anyhow::Result<Option<Evidence>> {
    let Some(arg) = arg else {
        return Ok(None);
    };
    let text = match arg.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading evidence {path}"))?,
        None => arg.to_string(),
    };
    let evidence = serde_json::from_str(&text).context("evidence must be a JSON object")?;
    Ok(Some(evidence))
}

fn parse_payload(arg: Option<&str>) -> anyhow::Result<Value> {
    match arg {
        Some(text) => serde_json::from_str(text).context("payload must be JSON"),
        None => Ok(Value::Object(Default::default())),
    }
}

fn cmd_init(ctx: &Ctx, graph: &Path) -> anyhow::Result<()> {
    let (pipeline, info) = ctx.scheduler(graph)?.init()?;
    ctx.print(&info, || {
        println!(
            "initialized '{}' with {} node(s); session {}",
            pipeline.name(),
            pipeline.node_count(),
            pipeline.session().unwrap_or("-")
        )
    })
}

fn cmd_node(ctx: &Ctx, cmd: NodeCommand) -> anyhow::Result<()> {
    match cmd {
        NodeCommand::Add(args) => {
            let mut spec = NodeSpec::new(args.id.clone(), args.kind);
            spec.handler = args.handler;
            spec.max_retries = args.max_retries;
            spec.after = args.after;
            spec.meta.ticket = args.ticket;
            spec.meta.role = args.dispatch_to;
            spec.meta.acceptance = args.acceptance;
            spec.meta.gate_type = args.gate_type;
            spec.meta.files = args
                .files
                .map(|f| f.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default();
            for assignment in &args.set {
                let (key, value) = NodePatch::parse_assignment(assignment)?;
                spec.meta.extra.insert(key, value);
            }
            let auto_gate = ctx.config.auto_gate && !args.no_gate;

            let scheduler = ctx.scheduler(&args.graph)?;
            let (summary, info) = scheduler.edit(&ctx.actor, &format!("node add {}", args.id), |g| {
                g.add_node(spec, auto_gate)
            })?;
            ctx.print(&summary, || {
                println!(
                    "added {} (revision {})",
                    summary.nodes_added.join(", "),
                    info.revision
                )
            })
        }
        NodeCommand::Remove { graph, id, cascade } => {
            let scheduler = ctx.scheduler(&graph)?;
            let (summary, info) = scheduler.edit(&ctx.actor, &format!("node remove {id}"), |g| {
                g.remove_node(&id, cascade)
            })?;
            ctx.print(&summary, || {
                println!(
                    "removed {} and {} edge(s) (revision {})",
                    summary.nodes_removed.join(", "),
                    summary.edges_removed.len(),
                    info.revision
                )
            })
        }
        NodeCommand::Modify {
            graph,
            id,
            set,
            unset,
        } => {
            let mut patch = NodePatch::default();
            for assignment in &set {
                let (key, value) = NodePatch::parse_assignment(assignment)?;
                patch = patch.set(key, value);
            }
            for key in unset {
                patch = patch.unset(key);
            }
            let scheduler = ctx.scheduler(&graph)?;
            let ((), info) = scheduler.edit(&ctx.actor, &format!("node modify {id}"), |g| {
                g.modify_node(&id, patch)
            })?;
            ctx.print(&serde_json::json!({ "node": id, "revision": info.revision }), || {
                println!("modified {id} (revision {})", info.revision)
            })
        }
    }
}

fn cmd_edge(ctx: &Ctx, cmd: EdgeCommand) -> anyhow::Result<()> {
    match cmd {
        EdgeCommand::Add {
            graph,
            from,
            to,
            label,
            allow_cycle,
        } => {
            let scheduler = ctx.scheduler(&graph)?;
            let ((), info) = scheduler.edit(&ctx.actor, &format!("edge add {from} -> {to}"), |g| {
                g.add_edge(&from, &to, label, allow_cycle)
            })?;
            ctx.print(
                &serde_json::json!({ "from": from, "to": to, "revision": info.revision }),
                || println!("added {from} -> {to} (revision {})", info.revision),
            )
        }
        EdgeCommand::Remove { graph, from, to } => {
            let scheduler = ctx.scheduler(&graph)?;
            let ((), info) = scheduler.edit(&ctx.actor, &format!("edge remove {from} -> {to}"), |g| {
                g.remove_edge(&from, &to)
            })?;
            ctx.print(
                &serde_json::json!({ "from": from, "to": to, "revision": info.revision }),
                || println!("removed {from} -> {to} (revision {})", info.revision),
            )
        }
        EdgeCommand::List { graph, from, to } => {
            let pipeline = ctx.scheduler(&graph)?.graph()?;
            let edges = pipeline.list_edges(&EdgeFilter { from, to });
            ctx.print(&edges, || {
                for edge in &edges {
                    let mut line = format!("{} -> {}", edge.from, edge.to);
                    if let Some(label) = &edge.label {
                        line.push_str(&format!(" [{label}]"));
                    }
                    if edge.cycle_override {
                        line.push_str(" (cycle override)");
                    }
                    println!("{line}");
                }
            })
        }
    }
}

fn cmd_validate(ctx: &Ctx, graph: &Path) -> anyhow::Result<()> {
    let pipeline = ctx.scheduler(graph)?.store().read_graph_file()?;
    let diagnostics = validate(&pipeline);
    ctx.print(&diagnostics, || {
        if diagnostics.is_empty() {
            println!("Pipeline is valid");
        }
        for diag in &diagnostics {
            let severity = match diag.severity {
                Severity::Error => "ERROR",
                Severity::Warning => "WARN",
                Severity::Info => "INFO",
            };
            println!("[{}] {}: {}", severity, diag.rule, diag.message);
        }
    })?;

    let errors: Vec<&str> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.as_str())
        .collect();
    if !errors.is_empty() {
        return Err(WardenError::ValidationError(errors.join("; ")).into());
    }
    Ok(())
}

#[derive(Serialize)]
struct StatusRow<'a> {
    id: &'a str,
    kind: NodeKind,
    status: NodeStatus,
    retries: u32,
    terminal: bool,
    deps_met: bool,
    claimed_by: Option<&'a str>,
}

fn status_rows(graph: &PipelineGraph, filter: Option<NodeStatus>, deps_met: bool) -> Vec<StatusRow<'_>> {
    graph
        .nodes()
        .filter(|n| filter.map_or(true, |s| n.status == s))
        .map(|n| StatusRow {
            id: &n.id,
            kind: n.kind,
            status: n.status,
            retries: n.retries,
            terminal: n.terminal,
            deps_met: graph.deps_met(&n.id),
            claimed_by: n.claimed_by.as_deref(),
        })
        .filter(|row| !deps_met || row.deps_met)
        .collect()
}

fn cmd_status(ctx: &Ctx, graph: &Path, filter: Option<NodeStatus>, deps_met: bool) -> anyhow::Result<()> {
    let pipeline = ctx.scheduler(graph)?.graph()?;
    let rows = status_rows(&pipeline, filter, deps_met);
    ctx.print(&rows, || {
        println!(
            "{} (revision {}{})",
            pipeline.name(),
            pipeline.revision(),
            if pipeline.is_paused() { ", paused" } else { "" }
        );
        for row in &rows {
            let mut line = format!("  {:<24} {:<9} {:<14}", row.id, row.kind.as_str(), row.status.as_str());
            if row.retries > 0 {
                line.push_str(&format!(" retries={}", row.retries));
            }
            if row.terminal {
                line.push_str(" terminal");
            }
            println!("{}", line.trim_end());
        }
    })
}

fn cmd_checkpoint(ctx: &Ctx, cmd: CheckpointCommand) -> anyhow::Result<()> {
    match cmd {
        CheckpointCommand::Save { graph } => {
            let (_, info) = ctx.scheduler(&graph)?.import(&ctx.actor)?;
            ctx.print(&info, || {
                println!("checkpoint {} saved (revision {})", info.seq, info.revision)
            })
        }
        CheckpointCommand::List { graph } => {
            let list = ctx.scheduler(&graph)?.store().checkpoints().list()?;
            ctx.print(&list, || {
                for cp in &list {
                    let at = cp
                        .saved_at
                        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                        .unwrap_or_else(|| "-".into());
                    println!("{:>6}  revision {:<6} {}", cp.seq, cp.revision, at);
                }
            })
        }
    }
}

fn cmd_audit(ctx: &Ctx, cmd: AuditCommand) -> anyhow::Result<()> {
    match cmd {
        AuditCommand::Verify { graph } => {
            let chain = ctx.scheduler(&graph)?.audit().verify_chain()?;
            ctx.print(&chain, || {
                println!("chain intact: {} entries, head {}", chain.entries, chain.head_hash)
            })
        }
        AuditCommand::Tail { graph, count } => {
            let entries = ctx.scheduler(&graph)?.audit().tail(count)?;
            ctx.print(&entries, || {
                for e in &entries {
                    println!(
                        "{:>6} {} {:<28} {} {}",
                        e.sequence_no, e.timestamp, e.action, e.actor, e.payload
                    );
                }
            })
        }
        AuditCommand::Summary { graph } => {
            let summary = ctx.scheduler(&graph)?.audit().summarize()?;
            ctx.print(&summary, || {
                println!("{} entries, head {}", summary.entries, summary.head_hash);
                if let (Some(first), Some(last)) = (&summary.first_timestamp, &summary.last_timestamp) {
                    println!("  {first} .. {last}");
                }
                for (action, n) in &summary.by_action {
                    println!("  {action:<28} {n}");
                }
            })
        }
    }
}

fn cmd_signal(ctx: &Ctx, cmd: SignalCommand) -> anyhow::Result<()> {
    match cmd {
        SignalCommand::Send {
            graph,
            signal_type,
            to,
            from,
            payload,
        } => {
            let from = from.unwrap_or_else(|| ctx.actor.id.clone());
            let payload = parse_payload(payload.as_deref())?;
            let path = ctx
                .scheduler(&graph)?
                .signals()
                .send(&from, &to, &signal_type, payload)?;
            ctx.print(&path, || println!("{}", path.display()))
        }
        SignalCommand::List {
            graph,
            participant,
            processed,
        } => {
            let channel = ctx.scheduler(&graph)?.signals().clone();
            let participants = match participant {
                Some(p) => vec![p],
                None => channel.participants()?,
            };
            let mut listing = Vec::new();
            for name in participants {
                let inbox = channel.inbox(&name)?;
                let files = if processed { inbox.processed()? } else { inbox.pending()? };
                let names: Vec<String> = files
                    .iter()
                    .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
                    .collect();
                listing.push(serde_json::json!({ "participant": name, "signals": names }));
            }
            ctx.print(&listing, || {
                for entry in &listing {
                    let signals = entry["signals"].as_array().map_or(0, Vec::len);
                    println!("{}: {signals}", entry["participant"].as_str().unwrap_or("?"));
                    for s in entry["signals"].as_array().into_iter().flatten() {
                        println!("  {}", s.as_str().unwrap_or("?"));
                    }
                }
            })
        }
    }
}

async fn cmd_watch(ctx: &Ctx, graph: &Path, once: bool) -> anyhow::Result<()> {
    let watcher = Watcher::new(ctx.scheduler(graph)?);
    if once {
        let report = watcher.poll_once()?;
        return ctx.print(&report, || {
            println!(
                "consumed {} (applied {}, rejected {}), dispatched {}",
                report.consumed,
                report.applied,
                report.rejected,
                report.dispatched.len()
            );
            for (node, target) in &report.dispatched {
                println!("  {node} -> {target}");
            }
        });
    }

    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; stopping after the current poll");
            let _ = tx.send(true);
        }
    });
    watcher.run(rx).await?;
    Ok(())
}
