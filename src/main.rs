use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use powchain::core::chain::BlockChain;
use powchain::core::params::*;
use powchain::core::types::Hash256;
use powchain::miner::MinerConfig;
use powchain::node;
use powchain::pow;
use powchain::storage::SledIndex;

const DEFAULT_DATA_DIR: &str = "powchain_data";
const DEFAULT_REGTEST_DIR: &str = "powchain_regtest";

#[derive(Parser)]
#[command(name = "powchain", version = "0.3.2")]
#[command(about = "powchain - proof-of-work block index with fork choice and retargeting")]
struct Cli {
    #[arg(long, global = true)]
    data_dir: Option<String>,
    /// Run on regtest (trivial difficulty, 10-block interval, data in powchain_regtest/)
    #[arg(long, global = true)]
    regtest: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the block index with the genesis block
    Init,
    /// Show blockchain info
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Mine blocks onto the local chain
    Mine {
        #[arg(short, long, default_value_t = 1)]
        count: u64,
        /// Mining threads (0 = one per CPU)
        #[arg(short, long, default_value_t = 0)]
        threads: usize,
    },
    /// List the canonical chain from genesis
    Blocks {
        #[arg(short, long, default_value_t = 20)]
        count: usize,
    },
    /// Show a stored block
    Show { hash: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("powchain=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    let params = if cli.regtest { NetworkParameters::regtest() } else { NetworkParameters::testnet() };
    let default_dir = if cli.regtest { DEFAULT_REGTEST_DIR } else { DEFAULT_DATA_DIR };
    let data_dir_str = cli.data_dir.unwrap_or_else(|| default_dir.to_string());
    let data_dir = &data_dir_str;

    if cli.regtest {
        println!("⚠️  Running on REGTEST (data: {})", data_dir);
    }

    match cli.command {
        Commands::Init => {
            let chain = open_chain(data_dir, params);
            println!("🔨 powchain initialized!");
            println!("  Data:    {}", data_dir);
            println!("  Network: {}", chain.params().id);
            println!("  Height:  {}", chain.get_height());
            println!("  Genesis: {}", chain.genesis_hash());
            println!("\n  Run: powchain mine --count 10{}", if cli.regtest { " --regtest" } else { "" });
        }

        Commands::Info { json } => {
            let chain = open_chain(data_dir, params);
            let info = chain.info();
            if json {
                println!("{}", serde_json::to_string_pretty(&info).unwrap());
            } else {
                println!("📊 powchain ({})", info.network);
                println!("  Height:     {}", info.height);
                println!("  Tip:        {}", info.tip);
                println!("  Bits:       {}", info.bits);
                println!("  Difficulty: {:.4}", info.difficulty);
                println!("  Chain work: 0x{}", info.chain_work);
            }
        }

        Commands::Mine { count, threads } => {
            let chain = Arc::new(open_chain(data_dir, params));
            let threads = if threads == 0 { num_cpus::get().max(1) } else { threads };
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(run_mining(chain.clone(), count, threads));
            if let Err(e) = chain.index().flush() {
                eprintln!("❌ {}", e);
                std::process::exit(1);
            }
            println!("  Height: {}  Tip: {}", chain.get_height(), chain.get_tip().hash());
        }

        Commands::Blocks { count } => {
            let chain = open_chain(data_dir, params);
            let blocks = chain
                .canonical_from(&chain.genesis_hash(), count)
                .unwrap_or_else(|e| fail(e));
            for b in blocks {
                println!(
                    "  #{:<6} {}  time={} bits={:#010x}",
                    b.height(),
                    b.hash(),
                    b.header().time,
                    b.header().bits
                );
            }
        }

        Commands::Show { hash } => {
            let Some(hash) = Hash256::from_hex(&hash) else {
                eprintln!("❌ Invalid block hash: {}", hash);
                std::process::exit(1);
            };
            let chain = open_chain(data_dir, params);
            match chain.get_block(&hash).unwrap_or_else(|e| fail(e)) {
                Some(b) => {
                    let target = pow::decode_compact(b.header().bits).unwrap_or_default();
                    println!("📦 Block {}", b.hash());
                    println!("  Height:     {}", b.height());
                    println!("  Prev:       {}", b.prev_hash());
                    println!("  Next:       {}", if b.next().is_null() { "-".to_string() } else { b.next().to_hex() });
                    println!("  Time:       {}", b.header().time);
                    println!("  Bits:       {:#010x}", b.header().bits);
                    println!("  Nonce:      {}", b.header().nonce);
                    println!("  Target:     0x{}", target.to_str_radix(16));
                    println!("  Chain work: 0x{}", b.chain_work().to_str_radix(16));
                }
                None => {
                    eprintln!("❌ Block not found: {}", hash);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn fail<E: std::fmt::Display, T>(e: E) -> T {
    eprintln!("❌ {}", e);
    std::process::exit(1);
}

fn open_chain(data_dir: &str, params: NetworkParameters) -> BlockChain<SledIndex> {
    std::fs::create_dir_all(data_dir).unwrap_or_else(|e| fail(e));
    let path = PathBuf::from(data_dir).join("index");
    let index = SledIndex::open(&path, &params).unwrap_or_else(|e| fail(e));
    BlockChain::new(index, params).unwrap_or_else(|e| fail(e))
}

// ─── Mining ─────────────────────────────────────────────────────────

async fn run_mining(chain: Arc<BlockChain<SledIndex>>, count: u64, threads: usize) {
    let (handle, _tip) = node::spawn_chain_worker(chain.clone());

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        println!("\n🛑 Shutting down gracefully...");
        stop_clone.store(true, Ordering::SeqCst);
    })
    .expect("Ctrl-C");

    println!("⛏️  Mining {} block(s) on {} with {} thread(s)", count, chain.params().id, threads);
    let config = MinerConfig { threads, count: Some(count) };
    match node::run_miner(chain, handle, config, stop).await {
        Ok(mined) => println!("✅ Mined {} block(s)", mined),
        Err(e) => {
            tracing::error!("Mining error: {}", e);
            std::process::exit(1);
        }
    }
}
