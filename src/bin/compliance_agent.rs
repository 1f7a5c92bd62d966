//! CLI entry point: `compliance-agent run|doctor|verify-bundle <path>`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use compliance_agent::config::AgentConfig;
use compliance_agent::control_plane::ControlPlaneClient;
use compliance_agent::drift::{Baseline, DriftDetector};
use compliance_agent::egress::{EgressRefresher, RecordingSink};
use compliance_agent::evidence::EvidenceStore;
use compliance_agent::observability;
use compliance_agent::orchestrator::TieredOrchestrator;
use compliance_agent::queue::OfflineQueue;
use compliance_agent::signer::{self, Signer};
use compliance_agent::supervisor::{install_signal_handlers, ShutdownFlag, Supervisor};
use compliance_agent::types::RunbookSpec;

#[derive(Parser)]
#[command(name = "compliance-agent", version, about = "On-host compliance drift-detection and self-healing agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor loop until a shutdown signal is received.
    Run,
    /// Validate configuration, secrets, and on-disk state without
    /// starting the supervisor loop.
    Doctor,
    /// Verify a stored evidence bundle's detached signature.
    VerifyBundle {
        /// Bundle id to verify (looked up in the evidence store).
        bundle_id: String,
        /// Path to the 32-byte raw Ed25519 public key to verify against.
        #[arg(long)]
        public_key: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Run => run(),
        Command::Doctor => doctor(),
        Command::VerifyBundle { bundle_id, public_key } => verify_bundle(&bundle_id, &public_key),
    }
}

fn load_config_or_exit(exit_on_error: u8) -> Result<AgentConfig, ExitCode> {
    AgentConfig::load_from_env().map_err(|e| {
        eprintln!("configuration error: {e}");
        ExitCode::from(exit_on_error)
    })
}

fn run() -> ExitCode {
    let config = match load_config_or_exit(1) {
        Ok(c) => c,
        Err(code) => return code,
    };
    observability::init_logging(&config.log_level);
    info!(site_id = %config.site_id, host_id = %config.host_id, "starting compliance-agent");

    let signer = match Signer::load_from_file(&config.signing_key_file) {
        Ok(s) => Some(s),
        Err(e) => {
            eprintln!("signing key error: {e}");
            return ExitCode::from(2);
        }
    };

    let queue = match OfflineQueue::open(&config.queue_dir()) {
        Ok(q) => q,
        Err(e) => {
            error!(error = %e, "cannot open offline queue");
            return ExitCode::from(3);
        }
    };
    let evidence = match EvidenceStore::open(&config.evidence_dir()) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "cannot open evidence store");
            return ExitCode::from(3);
        }
    };

    let control_plane = ControlPlaneClient::new(
        config.mcp_url.clone(),
        &config.client_cert_file,
        &config.client_key_file,
    )
    .map_err(|e| error!(error = %e, "control-plane client init failed"))
    .ok();

    let egress = match EgressRefresher::new(config.allowed_hosts.clone()) {
        Ok(e) => e,
        Err(e) => {
            error!(error = %e, "egress refresher init failed");
            return ExitCode::from(3);
        }
    };
    let firewall_sink = RecordingSink::default();

    let baseline = match Baseline::load(&config.baseline_path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("baseline unreadable: {e}");
            return ExitCode::from(1);
        }
    };
    let drift_detector = DriftDetector::new(baseline);

    let runbook_whitelist = load_runbooks(&config);
    let whitelist_ids: Vec<String> = runbook_whitelist.iter().map(|r| r.runbook_id.clone()).collect();
    let staged_rules = TieredOrchestrator::load_staged_rules(&config.l1_rules_staged_path());
    let orchestrator = TieredOrchestrator::new(staged_rules, whitelist_ids, config.l1_rules_staged_path());

    let mut supervisor = Supervisor::new(
        config,
        queue,
        evidence,
        signer,
        control_plane,
        egress,
        &firewall_sink,
        drift_detector,
        orchestrator,
        runbook_whitelist,
        None,
    );

    let shutdown = ShutdownFlag::new();
    install_signal_handlers(shutdown.clone());
    supervisor.run(&shutdown);

    if shutdown.is_set() {
        ExitCode::from(4)
    } else {
        ExitCode::SUCCESS
    }
}

#[derive(serde::Deserialize)]
struct RunbookFile {
    #[serde(default, rename = "runbook")]
    runbooks: Vec<RunbookSpec>,
}

fn load_runbooks(config: &AgentConfig) -> Vec<RunbookSpec> {
    std::fs::read_to_string(config.runbooks_path())
        .ok()
        .and_then(|raw| toml::from_str::<RunbookFile>(&raw).ok())
        .map(|f| f.runbooks)
        .unwrap_or_default()
}

fn doctor() -> ExitCode {
    let config = match load_config_or_exit(1) {
        Ok(c) => c,
        Err(code) => return code,
    };
    println!("configuration: OK (site={}, host={})", config.site_id, config.host_id);

    match Signer::load_from_file(&config.signing_key_file) {
        Ok(_) => println!("signing key: OK"),
        Err(e) => {
            println!("signing key: FAIL ({e})");
            return ExitCode::from(2);
        }
    }

    match EvidenceStore::open(&config.evidence_dir()) {
        Ok(store) => match store.stats() {
            Ok(stats) => println!(
                "evidence store: OK ({} bundles, oldest={:?}, newest={:?})",
                stats.total, stats.oldest, stats.newest
            ),
            Err(e) => println!("evidence store: FAIL ({e})"),
        },
        Err(e) => {
            println!("evidence store: FAIL ({e})");
            return ExitCode::from(3);
        }
    }

    match OfflineQueue::open(&config.queue_dir()) {
        Ok(queue) => println!("offline queue: OK (depth={})", queue.depth()),
        Err(e) => {
            println!("offline queue: FAIL ({e})");
            return ExitCode::from(3);
        }
    }

    match Baseline::load(&config.baseline_path) {
        Ok(_) => println!("baseline: OK"),
        Err(e) => println!("baseline: FAIL ({e})"),
    }

    match compliance_agent::control_plane::inspect_client_cert(&config.client_cert_file) {
        Ok(info) => println!(
            "client certificate: OK (subject={}, expires={})",
            info.subject, info.not_after
        ),
        Err(e) => println!("client certificate: FAIL ({e})"),
    }

    println!("doctor: all checks passed");
    ExitCode::SUCCESS
}

fn verify_bundle(bundle_id: &str, public_key_path: &PathBuf) -> ExitCode {
    let config = match load_config_or_exit(1) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let store = match EvidenceStore::open(&config.evidence_dir()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("cannot open evidence store: {e}");
            return ExitCode::from(3);
        }
    };
    let public_key = match signer::load_verifying_key_file(public_key_path) {
        Ok(k) => k,
        Err(e) => {
            eprintln!("cannot load public key: {e}");
            return ExitCode::from(1);
        }
    };
    match store.verify(bundle_id, &public_key) {
        Ok(true) => {
            println!("bundle {bundle_id}: signature OK");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("bundle {bundle_id}: signature INVALID or absent");
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("verification error: {e}");
            ExitCode::from(3)
        }
    }
}
