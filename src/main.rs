use space_keys::identity::{IdentityMaterialManager, MemberKeys};
use space_keys::protocol::derive_distribution_id;
use space_keys::rotation::RotationConfig;
use space_keys::space::{LocalSpaceService, SpaceDirectory, SpaceKeyService, SpaceSessionRegistry};
use space_keys::storage::{Database, KeyRecordStore};
use space_keys::utils::{format_timestamp, parse_log_level, setup_logger, Config};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::*;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;

const DEMO_SPACE: &str = "6f0c2d4e-1b7a-4c3f-8e9d-5a2b1c0d9e8f";

/// 命令行参数
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[clap(long)]
    config: Option<PathBuf>,

    /// 日志级别（覆盖配置文件）
    #[clap(long)]
    log_level: Option<String>,

    /// 启用详细日志
    #[clap(short, long, action = ArgAction::SetTrue)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 生成新的成员身份材料
    Provision {
        /// 用户ID
        #[clap(long)]
        user: String,

        /// 一次性预密钥数量
        #[clap(long, default_value = "10")]
        pre_keys: u32,

        /// 输出文件（默认为配置中的成员文件）
        #[clap(long)]
        out: Option<PathBuf>,
    },

    /// 列出空间的发送者密钥记录
    Inspect {
        #[clap(long)]
        space: String,
    },

    /// 删除空间的全部发送者密钥记录
    Forget {
        #[clap(long)]
        space: String,
    },

    /// 进程内演示：两个成员加密通信并轮换密钥
    Demo {
        #[clap(long, default_value = DEMO_SPACE)]
        space: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 加载配置文件
    let config_path = args.config.clone().unwrap_or_else(|| {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("space_keys")
            .join("config.json")
    });
    let config = Config::load(&config_path).with_context(|| format!("loading {}", config_path.display()))?;

    // 首次运行时保存默认配置
    if !config_path.exists() {
        config.save(&config_path)?;
    }

    // 初始化日志
    let level = if args.verbose {
        "debug".to_string()
    } else {
        args.log_level.clone().unwrap_or_else(|| config.log_level.clone())
    };
    setup_logger(parse_log_level(&level).map_err(|e| anyhow!(e))?).map_err(|e| anyhow!(e))?;
    debug!("Using config {}", config_path.display());

    match args.command {
        Command::Provision { user, pre_keys, out } => provision(&config, &user, pre_keys, out),
        Command::Inspect { space } => inspect(&config, &space),
        Command::Forget { space } => forget(&config, &space),
        Command::Demo { space } => demo(&space).await,
    }
}

fn provision(config: &Config, user: &str, pre_keys: u32, out: Option<PathBuf>) -> Result<()> {
    let member = IdentityMaterialManager::provision(user, pre_keys)?;
    let path = out.unwrap_or_else(|| config.member_file_path());

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&member)?)?;

    println!(
        "{} {} ({} pre-keys) -> {}",
        "Provisioned".green().bold(),
        user.bright_cyan(),
        pre_keys,
        path.display()
    );
    Ok(())
}

fn open_records(config: &Config) -> Result<KeyRecordStore> {
    config.ensure_data_dir()?;
    let db = Database::open(config.database_path())?;
    Ok(KeyRecordStore::new(&db)?)
}

fn inspect(config: &Config, space: &str) -> Result<()> {
    let distribution_id = derive_distribution_id(space);
    let records = open_records(config)?;
    let entities = records.list(distribution_id)?;

    println!("{} {} (distribution {})", "Space".bold(), space.bright_cyan(), distribution_id);
    if entities.is_empty() {
        println!("  {}", "no sender key records".yellow());
        return Ok(());
    }

    for entity in entities {
        let fingerprint = hex::encode(&entity.record[..entity.record.len().min(8)]);
        println!(
            "  {}.{}  {} bytes  {}  {}",
            entity.address.bright_cyan(),
            entity.device_id,
            entity.record.len(),
            fingerprint.dimmed(),
            format_timestamp(entity.created_at).blue()
        );
    }
    Ok(())
}

fn forget(config: &Config, space: &str) -> Result<()> {
    let records = open_records(config)?;
    let purged = records.delete_distribution(derive_distribution_id(space))?;
    records.flush()?;

    println!("{} {} records for {}", "Purged".red().bold(), purged, space.bright_cyan());
    Ok(())
}

fn demo_member(user: &str, directory: &SpaceDirectory) -> Result<LocalSpaceService> {
    let member: MemberKeys = IdentityMaterialManager::provision(user, 2)?;
    let records = KeyRecordStore::new(&Database::open_temporary()?)?;
    let registry = Arc::new(SpaceSessionRegistry::new(member, records)?);

    Ok(LocalSpaceService::new(
        registry,
        directory.clone(),
        RotationConfig::default().interval,
    ))
}

async fn exchange(from: &LocalSpaceService, to: &LocalSpaceService, space: &str, text: &str) -> Result<()> {
    let ciphertext = from.registry().encrypt(space, text).await?;
    let plaintext = to.registry().decrypt(space, &ciphertext, from.registry().user_id()).await?;

    println!(
        "  {} -> {}: {} {}",
        from.registry().user_id().bright_cyan(),
        to.registry().user_id().bright_cyan(),
        plaintext.white(),
        format!("({} bytes on the wire)", ciphertext.len()).dimmed()
    );
    Ok(())
}

async fn demo(space: &str) -> Result<()> {
    let directory = SpaceDirectory::new();
    let alice = demo_member("alice", &directory)?;
    let bob = demo_member("bob", &directory)?;

    println!("{}", format!("Space {}", space).green().bold());
    alice.join_space(space).await?;
    bob.join_space(space).await?;

    for service in [&alice, &bob] {
        for due in service.get_user_spaces_to_rotate_keys().await? {
            service.rotate_sender_key(&due).await?;
        }
    }
    alice.sync_space(space).await?;
    bob.sync_space(space).await?;

    exchange(&alice, &bob, space, "hello bob").await?;
    exchange(&bob, &alice, space, "hi alice, I'm 5 minutes away").await?;

    println!("{}", "Rotating alice's sender key".yellow());
    alice.rotate_sender_key(space).await?;
    let report = bob.sync_space(space).await?;
    info!("Bob's sync after rotation: {:?}", report.applied);

    exchange(&alice, &bob, space, "still reading you after rotation").await?;

    alice.leave_space(space).await?;
    bob.leave_space(space).await?;
    println!("{}", "Done".green().bold());
    Ok(())
}
