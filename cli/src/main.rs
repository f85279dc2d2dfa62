//! `syl-listing-pro` entry point.
//!
//! Commands: default/`gen [files…]`, `update rules`, `set key <value>`,
//! `version`. SIGINT/SIGTERM cancel the root token; the run controller then
//! cancels every already-submitted remote job before the process exits 130.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use syl_core::{run_gen, run_update_rules, GenOptions, RunCancelled, RunConfig, UpdateRulesOptions};

const EXIT_FAILED: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "syl-listing-pro",
    about = "生成双语 listing",
    disable_version_flag = true,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// 需求文件或目录（等同 gen）
    #[arg(value_name = "FILE_OR_DIR")]
    inputs: Vec<PathBuf>,

    /// 输出 NDJSON 详细日志
    #[arg(long, global = true)]
    verbose: bool,

    /// 日志文件路径
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// 输出目录
    #[arg(short = 'o', long = "out", global = true, default_value = ".")]
    out: PathBuf,

    /// 每个需求文件生成候选数量
    #[arg(short = 'n', long = "num", global = true, default_value_t = 1)]
    num: usize,

    /// 显示版本信息
    #[arg(short = 'v', long = "version")]
    version: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 生成 listing
    Gen {
        #[arg(value_name = "FILE_OR_DIR", required = true)]
        inputs: Vec<PathBuf>,
    },
    /// 更新资源
    Update {
        #[command(subcommand)]
        command: UpdateCommand,
    },
    /// 设置配置
    Set {
        #[command(subcommand)]
        command: SetCommand,
    },
    /// 显示版本信息
    Version,
}

#[derive(Debug, Subcommand)]
enum UpdateCommand {
    /// 清除本地规则缓存并下载最新规则
    Rules,
}

#[derive(Debug, Subcommand)]
enum SetCommand {
    /// 设置 SYL_LISTING_KEY
    Key {
        #[arg(value_name = "SYL_LISTING_KEY")]
        value: String,
    },
}

fn print_version() {
    println!("syl-listing-pro {}", env!("CARGO_PKG_VERSION"));
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
}

/// Cancel the root token on SIGINT or SIGTERM.
fn install_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(stream) => stream,
                    Err(_) => {
                        let _ = ctrl_c.await;
                        cancel.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        cancel.cancel();
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    if cli.version {
        print_version();
        return ExitCode::SUCCESS;
    }

    tracing::debug!("syl-listing-pro {} starting", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());

    let cfg = RunConfig::default();
    let gen_opts = |inputs: Vec<PathBuf>| GenOptions {
        verbose: cli.verbose,
        log_file: cli.log_file.clone(),
        output_dir: cli.out.clone(),
        num: cli.num,
        inputs,
    };

    let result = match &cli.command {
        None => {
            if cli.inputs.is_empty() {
                let _ = Cli::command().print_help();
                return ExitCode::SUCCESS;
            }
            run_gen(&cancel, gen_opts(cli.inputs.clone()), &cfg).await
        }
        Some(Command::Gen { inputs }) => run_gen(&cancel, gen_opts(inputs.clone()), &cfg).await,
        Some(Command::Update {
            command: UpdateCommand::Rules,
        }) => {
            run_update_rules(
                &cancel,
                UpdateRulesOptions {
                    verbose: cli.verbose,
                    log_file: cli.log_file.clone(),
                    force: true,
                },
                &cfg,
            )
            .await
        }
        Some(Command::Set {
            command: SetCommand::Key { value },
        }) => syl_core::config::save_listing_key(value).map_err(Into::into),
        Some(Command::Version) => {
            print_version();
            return ExitCode::SUCCESS;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if err.is::<RunCancelled>() => ExitCode::from(EXIT_INTERRUPTED),
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_FAILED)
        }
    }
}
