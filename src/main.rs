//! BT2C daemon and operator commands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bt2c::block::genesis::GenesisConfig;
use bt2c::config::Config;
use bt2c::crypto::Keypair;
use bt2c::node::Node;
use bt2c::shutdown::ShutdownManager;
use bt2c::state::RegistrationPayload;
use bt2c::store::BlockStore;
use bt2c::wallet::Wallet;

#[derive(Parser, Debug)]
#[command(name = "bt2cd")]
#[command(about = "BT2C Proof-of-Stake node daemon", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Node lifecycle
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },
    /// Wallet management
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },
    /// Validator management
    Validator {
        #[command(subcommand)]
        action: ValidatorAction,
    },
    /// Chain bootstrap
    Chain {
        #[command(subcommand)]
        action: ChainAction,
    },
}

#[derive(Subcommand, Debug)]
enum NodeAction {
    /// Run the node until interrupted
    Start {
        /// Wallet file of the local validator (enables block production)
        #[arg(long)]
        wallet: Option<PathBuf>,
        /// Wallet password (prompted from BT2C_WALLET_PASSWORD otherwise)
        #[arg(long)]
        password: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum WalletAction {
    /// Create a new wallet and print the address and recovery phrase
    Create {
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        label: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ValidatorAction {
    /// Register the wallet's address as a validator
    Register {
        #[arg(long)]
        wallet: PathBuf,
        #[arg(long)]
        password: Option<String>,
        /// Stake in satoshis
        #[arg(long)]
        stake: u64,
        #[arg(long, default_value = "")]
        moniker: String,
    },
}

#[derive(Subcommand, Debug)]
enum ChainAction {
    /// Write a genesis document and initialize the block store
    Init {
        /// Developer node address credited at genesis
        #[arg(long)]
        address: String,
        /// Overwrite an existing genesis document
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: bool, data_dir: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), "bt2cd.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .init();
    guard
}

fn load_wallet(path: &PathBuf, password: Option<String>) -> Result<Wallet, i32> {
    let password = password
        .or_else(|| std::env::var("BT2C_WALLET_PASSWORD").ok())
        .ok_or_else(|| {
            eprintln!("❌ No wallet password given (use --password or BT2C_WALLET_PASSWORD)");
            1
        })?;
    Wallet::load(path, &password).map_err(|e| {
        eprintln!("❌ Cannot open wallet: {e}");
        1
    })
}

fn genesis_path(config: &Config) -> PathBuf {
    config.network_data_dir().join("genesis.json")
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load_or_create(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("❌ Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(config.network_data_dir()) {
        eprintln!("❌ Cannot create data dir: {e}");
        std::process::exit(2);
    }
    let _log_guard = init_tracing(cli.verbose, &config.network_data_dir());

    let code = match cli.command {
        Command::Node { action } => run_node(action, config).await,
        Command::Wallet { action } => run_wallet(action, &config),
        Command::Validator { action } => run_validator(action, config).await,
        Command::Chain { action } => run_chain_init(action, &config).await,
    };
    std::process::exit(code);
}

async fn run_node(action: NodeAction, config: Config) -> i32 {
    let NodeAction::Start { wallet, password } = action;

    let genesis = match GenesisConfig::load_from_file(genesis_path(&config)) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("❌ {e}");
            eprintln!("   Run `bt2cd chain init --address <addr>` first.");
            return 1;
        }
    };

    let local_key = match wallet {
        Some(path) => match load_wallet(&path, password) {
            Ok(w) => {
                tracing::info!("🔑 Validator wallet loaded: {}", w.address());
                Some(w.keypair().clone())
            }
            Err(code) => return code,
        },
        None => None,
    };

    let node = match Node::open(config, genesis).await {
        Ok(n) => Arc::new(n),
        Err(e) => {
            eprintln!("❌ Failed to open node: {e}");
            return e.exit_code();
        }
    };

    let mut shutdown = ShutdownManager::new();
    let _injector = node.start(local_key, &mut shutdown);
    tracing::info!("🚀 BT2C node running; press ctrl+c to stop");

    shutdown.wait_for_shutdown().await;
    node.flush();
    0
}

fn run_wallet(action: WalletAction, config: &Config) -> i32 {
    let WalletAction::Create {
        password,
        output,
        label,
    } = action;

    let password = password
        .or_else(|| std::env::var("BT2C_WALLET_PASSWORD").ok())
        .unwrap_or_default();
    if password.is_empty() {
        eprintln!("❌ Refusing to write an unencrypted wallet; provide --password");
        return 1;
    }

    let network = config.network_type();
    let wallet = match Wallet::create(network, label) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("❌ {e}");
            return 2;
        }
    };
    let path = output.unwrap_or_else(|| config.network_data_dir().join("wallet.json"));
    if let Err(e) = wallet.save(&path, &password) {
        eprintln!("❌ {e}");
        return 2;
    }

    println!("✅ Wallet created: {}", path.display());
    println!("   Address:  {}", wallet.address());
    println!("   Recovery phrase (write it down, shown once):");
    println!("   {}", wallet.mnemonic());
    0
}

async fn run_validator(action: ValidatorAction, config: Config) -> i32 {
    let ValidatorAction::Register {
        wallet,
        password,
        stake,
        moniker,
    } = action;

    let wallet = match load_wallet(&wallet, password) {
        Ok(w) => w,
        Err(code) => return code,
    };
    let genesis = match GenesisConfig::load_from_file(genesis_path(&config)) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("❌ {e}");
            return 1;
        }
    };

    let node = match Node::open(config, genesis).await {
        Ok(n) => n,
        Err(e) => {
            eprintln!("❌ Failed to open node: {e}");
            return e.exit_code();
        }
    };

    let payload = RegistrationPayload::new_signed(wallet.keypair(), stake, moniker);
    match node.state().register_validator(&payload).await {
        Ok(()) => {
            println!("✅ Validator {} registered with {} sats", payload.address, stake);
            node.flush();
            0
        }
        Err(e) => {
            eprintln!("❌ Registration failed: {e}");
            e.exit_code()
        }
    }
}

async fn run_chain_init(action: ChainAction, config: &Config) -> i32 {
    let ChainAction::Init { address, force } = action;

    let path = genesis_path(config);
    if path.exists() && !force {
        eprintln!(
            "❌ Genesis document already exists at {} (use --force to overwrite)",
            path.display()
        );
        return 1;
    }

    let chain_id = config.network_type().chain_id().to_string();
    let genesis = GenesisConfig::create(chain_id, address, bt2c::types::now_ms());
    if let Err(e) = genesis.save_to_file(&path) {
        eprintln!("❌ {e}");
        return 2;
    }

    // Lay down the genesis block so `node start` has a chain tip.
    let blocks_dir = config.network_data_dir().join("blocks");
    if force {
        let _ = std::fs::remove_dir_all(&blocks_dir);
        let _ = std::fs::remove_dir_all(config.network_data_dir().join("node.db"));
    }
    let store = match BlockStore::open(&blocks_dir) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ {e}");
            return e.exit_code();
        }
    };
    if store.is_empty() {
        if let Err(e) = store.add_block(&genesis.genesis_block) {
            eprintln!("❌ {e}");
            return e.exit_code();
        }
    }

    println!("✅ Chain initialized: {}", path.display());
    println!(
        "   Genesis block {} credits {} with 101 BT2C",
        hex::encode(genesis.genesis_block.hash),
        genesis.genesis_block.transactions[0].recipient
    );
    0
}
