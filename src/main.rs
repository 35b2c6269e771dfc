use chrono::Utc;
use clap::{Parser, Subcommand};
use configuration::cli::ConfigOverrides;
use configuration::ClientSettings;
use core_types::{
    AlertLevel, Decision, DecisionAction, HealthStatus, Outcome, Proposal, ProposalStatus,
    RiskAssessment, Signal, SystemAlert, SystemStatus,
};
use events::{DecisionData, EventKind, OutcomeData, ProposalData, SignalData};
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::time::Duration;
use stream_client::StreamingClient;
use stream_server::PublishRecord;
use uuid::Uuid;

/// The main entry point for the Pulse event streaming services.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `STREAM__*` overrides may live in a .env file.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut settings = configuration::load_config_from(&cli.overrides.config)?;
    cli.overrides.apply(&mut settings);
    let _guard = configuration::init_tracing(&settings.logging)?;

    match cli.command {
        Commands::Serve => stream_server::run_server(settings.server, shutdown_signal()).await,
        Commands::Listen(args) => handle_listen(args, settings.client).await,
        Commands::PublishDemo(args) => handle_publish_demo(args).await,
    }
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Real-time distribution of pipeline events over WebSocket and Server-Sent Events.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the streaming server.
    Serve,
    /// Connect as a client and print every event received.
    Listen(ListenArgs),
    /// Post sample pipeline events to a running server.
    PublishDemo(PublishDemoArgs),
}

#[derive(Parser)]
struct ListenArgs {
    /// Topics to subscribe to (e.g., "risk,system"). Defaults to the configured list.
    #[arg(long, value_delimiter = ',')]
    topics: Vec<String>,

    /// Only open the push (SSE) transport.
    #[arg(long, conflicts_with = "socket_only")]
    push_only: bool,

    /// Only open the socket transport.
    #[arg(long)]
    socket_only: bool,
}

#[derive(Parser)]
struct PublishDemoArgs {
    /// Base URL of the stream server.
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    server: String,

    /// How many rounds of one-event-per-topic to send.
    #[arg(long, default_value_t = 1)]
    rounds: u32,

    /// Pause between rounds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C.");
    }
}

// ==============================================================================
// Listen Command Logic
// ==============================================================================

async fn handle_listen(args: ListenArgs, mut settings: ClientSettings) -> anyhow::Result<()> {
    if !args.topics.is_empty() {
        settings.subscriptions = args.topics;
    }
    if args.push_only {
        settings.enable_socket = false;
    }
    if args.socket_only {
        settings.enable_push = false;
    }

    let client = StreamingClient::new(settings);
    register_printers(&client);

    client.connect()?;
    shutdown_signal().await;
    client.disconnect().await;
    Ok(())
}

/// One handler per event type that renders the payload as a single line.
fn register_printers(client: &StreamingClient) {
    client.on(EventKind::Signal, |data| {
        let signal: SignalData = serde_json::from_value(data.clone())?;
        println!("[signal]   {} ({}): {}", signal.source, signal.id, signal.content);
        Ok(())
    });
    client.on(EventKind::Proposal, |data| {
        let proposal: ProposalData = serde_json::from_value(data.clone())?;
        println!(
            "[proposal] {} size={} expected={} status={:?}",
            proposal.assets.join(","),
            proposal.size_pct,
            proposal.expected_return,
            proposal.status
        );
        Ok(())
    });
    client.on(EventKind::Decision, |data| {
        let decision: DecisionData = serde_json::from_value(data.clone())?;
        println!(
            "[decision] {} proposal={} confidence={}",
            decision.action, decision.proposal_id, decision.confidence
        );
        Ok(())
    });
    client.on(EventKind::Outcome, |data| {
        let outcome: OutcomeData = serde_json::from_value(data.clone())?;
        println!(
            "[outcome]  proposal={} return={} sharpe={} drawdown={}",
            outcome.proposal_id, outcome.return_pct, outcome.sharpe_ratio, outcome.max_drawdown
        );
        Ok(())
    });
    client.on(EventKind::Risk, |data| {
        let risk: RiskAssessment = serde_json::from_value(data.clone())?;
        let flag = if risk.is_high_risk() {
            " HIGH RISK"
        } else {
            ""
        };
        println!(
            "[risk]     score={} var={} cvar={}{}",
            risk.risk_score, risk.var, risk.cvar, flag
        );
        Ok(())
    });
    client.on(EventKind::System, |data| {
        // The socket greeting shares this type but carries a plain message.
        match serde_json::from_value::<SystemStatus>(data.clone()) {
            Ok(system) => {
                println!("[system]   health={:?}", system.health);
                if let Some(worst) = system.worst_alert().filter(|a| a.level >= AlertLevel::Warning) {
                    println!("           {:?}: {}", worst.level, worst.message);
                }
            }
            Err(_) => println!("[system]   {}", data["message"].as_str().unwrap_or_default()),
        }
        Ok(())
    });

    client.on(EventKind::Connection, |data| {
        tracing::info!(transport = %data["transport"], "Connected.");
        Ok(())
    });
    client.on(EventKind::Disconnection, |data| {
        tracing::warn!(transport = %data["transport"], "Disconnected.");
        Ok(())
    });
    client.on(EventKind::Error, |data| {
        tracing::warn!(transport = %data["transport"], error = %data["error"], "Transport error.");
        Ok(())
    });
}

// ==============================================================================
// Publish-Demo Command Logic
// ==============================================================================

async fn handle_publish_demo(args: PublishDemoArgs) -> anyhow::Result<()> {
    let http = reqwest::Client::new();
    let url = format!("{}/api/events", args.server.trim_end_matches('/'));

    for round in 1..=args.rounds {
        for record in demo_records()? {
            let response = http.post(&url).json(&record).send().await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("server rejected {} event ({}): {}", record.event_type, status, body);
            }
            tracing::info!(round, event_type = %record.event_type, "Published.");
        }
        if round < args.rounds {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }
    Ok(())
}

/// One sample record per topic, linked the way the pipeline links them.
fn demo_records() -> anyhow::Result<Vec<PublishRecord>> {
    let now = Utc::now();
    let signal = Signal {
        id: Uuid::new_v4(),
        source: "news".to_string(),
        content: "Chip maker raises full-year guidance".to_string(),
        scores: BTreeMap::from([("sentiment".to_string(), 0.82), ("relevance".to_string(), 0.9)]),
        confidences: BTreeMap::from([("sentiment".to_string(), 0.75)]),
        timestamp: now,
    };
    let proposal = Proposal {
        id: Uuid::new_v4(),
        thesis: "Semiconductor demand outpaces supply through next quarter".to_string(),
        assets: vec!["NVDA".to_string(), "AMD".to_string()],
        size_pct: dec!(0.05),
        risk_score: dec!(0.35),
        expected_return: dec!(0.12),
        status: ProposalStatus::Pending,
        created_at: now,
    };
    let decision = Decision {
        id: Uuid::new_v4(),
        proposal_id: proposal.id,
        action: DecisionAction::ReduceSize,
        confidence: dec!(0.7),
        size_adjustment: Some(dec!(0.5)),
        created_at: now,
    };
    let outcome = Outcome {
        id: Uuid::new_v4(),
        proposal_id: proposal.id,
        return_pct: dec!(0.034),
        sharpe_ratio: dec!(1.4),
        max_drawdown: dec!(0.021),
        win_rate: dec!(0.58),
        created_at: now,
    };
    let risk = RiskAssessment {
        risk_score: dec!(0.83),
        var: dec!(0.045),
        cvar: dec!(0.061),
        volatility: dec!(0.24),
        correlation: Some(dec!(0.67)),
        recommendations: vec!["Reduce semiconductor concentration".to_string()],
    };
    let system = SystemStatus {
        health: HealthStatus::Degraded,
        metrics: BTreeMap::from([("ingest_lag_ms".to_string(), 850.0)]),
        alerts: vec![SystemAlert {
            level: AlertLevel::Warning,
            message: "News feed lagging".to_string(),
        }],
    };

    Ok(vec![
        record("signal", &signal)?,
        record("proposal", &proposal)?,
        record("decision", &decision)?,
        record("outcome", &outcome)?,
        record("risk", &risk)?,
        record("system", &system)?,
    ])
}

fn record<T: serde::Serialize>(event_type: &str, value: &T) -> anyhow::Result<PublishRecord> {
    Ok(PublishRecord {
        event_type: event_type.to_string(),
        data: serde_json::to_value(value)?,
    })
}
