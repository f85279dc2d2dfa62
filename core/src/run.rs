//! The run controller.
//!
//! One run: sync rules, discover requirement files, fan `files × replicas`
//! tasks across a semaphore-capped worker pool, poll every submitted job
//! while draining its trace stream, write the Markdown pair, convert both to
//! Word. On interrupt the controller cancels every already-submitted remote
//! job before returning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use syl_client::types::{ExchangeResp, GenerateReq};
use syl_client::{Api, ApiError, OrCancelExt, TraceEvent};

use crate::config::{self, ConfigError};
use crate::docx::{MarkdownToDocx, SylMd2Doc};
use crate::input::{self, RequirementFile};
use crate::logger::Logger;
use crate::output;
use crate::rules::{self, CacheState, RulesError};
use crate::trace::{
    human_duration_short, render_worker_trace_line, should_skip_verbose_http_trace,
    should_skip_verbose_worker_trace, task_prefix,
};

const BASE_URL_ENV: &str = "SYL_WORKER_BASE_URL";
const DEFAULT_WORKER_BASE_URL: &str = "http://127.0.0.1:8080";

const DEFAULT_MAX_CONCURRENT_TASKS: usize = 4;
const DEFAULT_POLL_INTERVAL_MS: u64 = 800;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 900;

const TRACE_BURSTS_PER_DRAIN: usize = 3;
const TRACE_PAGE_LIMIT: u64 = 300;

const CANCEL_SWEEP_DEADLINE: Duration = Duration::from_secs(20);
const CANCEL_SWEEP_PERMITS: usize = 8;
const CANCEL_WAIT_TIMEOUT: Duration = Duration::from_secs(25);

/// The run was interrupted; the CLI maps this to exit code 130.
#[derive(Debug, Clone, Copy, Error)]
#[error("已取消")]
pub struct RunCancelled;

#[derive(Debug, Clone, Default)]
pub struct GenOptions {
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub num: usize,
    pub inputs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRulesOptions {
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
    pub force: bool,
}

/// Process-level knobs. Production uses `RunConfig::default()`; tests inject
/// their own base URL, poll cadence, cache dir, root key, and converter.
#[derive(Clone)]
pub struct RunConfig {
    pub base_url: String,
    pub max_concurrent_tasks: usize,
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
    /// Rules cache root; `None` means the platform default.
    pub cache_dir: Option<PathBuf>,
    /// Root public key override; `None` means the embedded key.
    pub rules_root_public_key_pem: Option<Vec<u8>>,
    /// Key store override; `None` means `~/.syl-listing-pro/.env`.
    pub env_path: Option<PathBuf>,
    pub converter: Arc<dyn MarkdownToDocx>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var(BASE_URL_ENV)
                .unwrap_or_else(|_| DEFAULT_WORKER_BASE_URL.to_string()),
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_timeout_secs: DEFAULT_POLL_TIMEOUT_SECS,
            cache_dir: None,
            rules_root_public_key_pem: None,
            env_path: None,
            converter: Arc::new(SylMd2Doc),
        }
    }
}

#[derive(Debug, Clone)]
struct GenerateTask {
    file: RequirementFile,
    label: String,
}

#[derive(Debug, Clone)]
struct SubmittedJob {
    job_id: String,
    label: String,
}

/// Jobs stay registered until process exit so the interrupt path always
/// sees the full set.
#[derive(Default)]
struct SubmittedJobs {
    jobs: Mutex<HashMap<String, SubmittedJob>>,
}

impl SubmittedJobs {
    fn add(&self, job_id: &str, label: &str) {
        let id = job_id.trim();
        if id.is_empty() {
            return;
        }
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(
            id.to_string(),
            SubmittedJob {
                job_id: id.to_string(),
                label: label.to_string(),
            },
        );
    }

    fn snapshot(&self) -> Vec<SubmittedJob> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.values().cloned().collect()
    }
}

struct RunContext {
    api: Api,
    access_token: String,
    tenant_id: String,
    log: Arc<Logger>,
    verbose: bool,
    output_dir: PathBuf,
    poll_interval: Duration,
    poll_timeout: Duration,
    converter: Arc<dyn MarkdownToDocx>,
    registry: SubmittedJobs,
    success: AtomicI64,
    failed: AtomicI64,
}

pub async fn run_gen(cancel: &CancellationToken, opts: GenOptions, cfg: &RunConfig) -> Result<()> {
    let num = opts.num.max(1);
    let cache_dir = match &cfg.cache_dir {
        Some(dir) => dir.clone(),
        None => rules::default_cache_dir()?,
    };
    let syl_key = load_key_for_run(cfg)?;
    let log = Arc::new(Logger::new(opts.verbose, opts.log_file.as_deref())?);
    let start_all = Instant::now();

    let mut api = Api::new(cfg.base_url.as_str())?;
    install_http_trace(&mut api, Arc::clone(&log), opts.verbose);

    let ex = api.exchange(cancel, &syl_key).await.map_err(map_run_err)?;
    tracing::debug!(tenant_id = %ex.tenant_id, "exchange ok");

    let root_pem: &[u8] = cfg
        .rules_root_public_key_pem
        .as_deref()
        .unwrap_or(rules::embedded_root_public_key());
    let state = sync_rules(&api, cancel, &ex, &cache_dir, root_pem, &log).await?;
    let marker = rules::load_input_marker_from_archive(&state.archive_path)?;

    let files = input::discover(&opts.inputs, &marker)?;
    let tasks = build_generate_tasks(&files, num);
    tracing::debug!(
        rules_version = %state.rules_version,
        files = files.len(),
        tasks = tasks.len(),
        "run prepared"
    );

    let ctx = Arc::new(RunContext {
        api,
        access_token: ex.access_token.clone(),
        tenant_id: ex.tenant_id.clone(),
        log: Arc::clone(&log),
        verbose: opts.verbose,
        output_dir: opts.output_dir.clone(),
        poll_interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
        poll_timeout: Duration::from_secs(cfg.poll_timeout_secs.max(1)),
        converter: Arc::clone(&cfg.converter),
        registry: SubmittedJobs::default(),
        success: AtomicI64::new(0),
        failed: AtomicI64::new(0),
    });

    let (sweep, mut sweep_done) = CancelSweep::new(Arc::clone(&ctx));
    let watcher = tokio::spawn({
        let token = cancel.clone();
        let sweep = Arc::clone(&sweep);
        async move {
            token.cancelled().await;
            sweep.trigger();
        }
    });

    let sem = Arc::new(Semaphore::new(cfg.max_concurrent_tasks.max(1)));
    let mut join = JoinSet::new();
    for task in tasks {
        let ctx = Arc::clone(&ctx);
        let sem = Arc::clone(&sem);
        let token = cancel.clone();
        join.spawn(async move {
            let Ok(Ok(_permit)) = sem.clone().acquire_owned().or_cancel(&token).await else {
                ctx.failed.fetch_add(1, Ordering::SeqCst);
                ctx.log.info(&format!(
                    "{} 生成失败：已取消",
                    task_prefix(&ctx.tenant_id, 0, &task.label)
                ));
                return;
            };
            if run_generate_task(&ctx, &token, &task).await {
                ctx.success.fetch_add(1, Ordering::SeqCst);
            } else {
                ctx.failed.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    while join.join_next().await.is_some() {}

    if cancel.is_cancelled() {
        sweep.trigger();
        let waited =
            tokio::time::timeout(CANCEL_WAIT_TIMEOUT, sweep_done.wait_for(|done| *done)).await;
        if waited.is_err() {
            log.info("取消等待超时，已退出");
        }
        return Err(anyhow::Error::new(RunCancelled));
    }
    watcher.abort();

    let success = ctx.success.load(Ordering::SeqCst);
    let failed = ctx.failed.load(Ordering::SeqCst);
    log.info(&format!(
        "任务完成：成功 {success}，失败 {failed}，总耗时 {}",
        human_duration_short(start_all.elapsed())
    ));
    if failed > 0 {
        bail!("存在失败任务");
    }
    Ok(())
}

/// Clear-and-resync entry behind `update rules`. Prints the active rules
/// version on success.
pub async fn run_update_rules(
    cancel: &CancellationToken,
    opts: UpdateRulesOptions,
    cfg: &RunConfig,
) -> Result<()> {
    let cache_dir = match &cfg.cache_dir {
        Some(dir) => dir.clone(),
        None => rules::default_cache_dir()?,
    };
    let syl_key = load_key_for_run(cfg)?;
    let log = Logger::new(opts.verbose, opts.log_file.as_deref())?;

    let api = Api::new(cfg.base_url.as_str())?;
    let ex = api.exchange(cancel, &syl_key).await.map_err(map_run_err)?;
    if opts.force {
        rules::clear(&cache_dir, &ex.tenant_id)?;
    }
    let state = load_state_tolerant(&cache_dir, &ex.tenant_id)?;

    let res = match api
        .resolve_rules(cancel, &ex.access_token, &state.rules_version)
        .await
    {
        Err(ApiError::Canceled) => return Err(anyhow::Error::new(RunCancelled)),
        Err(_) => {
            if !state.rules_version.is_empty() && rules::has_archive(&state.archive_path) {
                log.info(&format!("规则中心不可达，回退本地规则（{}）", state.rules_version));
                return Ok(());
            }
            bail!("规则中心不可达且本地无规则缓存");
        }
        Ok(res) => res,
    };
    if res.up_to_date && rules::has_archive(&state.archive_path) {
        log.info(&res.rules_version);
        return Ok(());
    }

    let (data, got_sha) = api
        .download(cancel, &ex.access_token, &res.download_url)
        .await
        .map_err(map_run_err)?;
    if got_sha != res.manifest_sha256 {
        bail!("规则包 sha256 不匹配: got={got_sha} want={}", res.manifest_sha256);
    }
    let archive_path = rules::save_archive(&cache_dir, &ex.tenant_id, &res.rules_version, &data)?;
    let root_pem: &[u8] = cfg
        .rules_root_public_key_pem
        .as_deref()
        .unwrap_or(rules::embedded_root_public_key());
    rules::verify_archive_signature(
        &cache_dir,
        root_pem,
        &archive_path,
        &res.signature_base64,
        &res.signing_public_key_path_in_archive,
        &res.signing_public_key_signature_base64,
    )?;
    rules::save_state(
        &cache_dir,
        &ex.tenant_id,
        &CacheState {
            rules_version: res.rules_version.clone(),
            manifest_sha256: res.manifest_sha256.clone(),
            archive_path,
        },
    )?;
    log.info(&res.rules_version);
    Ok(())
}

fn install_http_trace(api: &mut Api, log: Arc<Logger>, verbose: bool) {
    api.set_trace(Arc::new(move |ev: TraceEvent| {
        if should_skip_verbose_http_trace(verbose, &ev) {
            return;
        }
        log.event(
            &format!("worker_http_{}", ev.stage.as_str()),
            json!({
                "method": ev.method,
                "url": ev.url,
                "status_code": ev.status_code,
                "duration_ms": ev.duration_ms,
                "request": ev.request,
                "response": ev.response,
                "error": ev.error,
            }),
        );
    }));
}

fn load_key_for_run(cfg: &RunConfig) -> Result<String> {
    let loaded = match &cfg.env_path {
        Some(path) => config::load_listing_key_from(path),
        None => config::load_listing_key(),
    };
    match loaded {
        Ok(key) => Ok(key),
        Err(ConfigError::KeyNotConfigured) => {
            bail!("尚未配置 KEY，需要执行\nsyl-listing-pro set key <SYL_LISTING_KEY>")
        }
        Err(err) => Err(err.into()),
    }
}

fn map_run_err(err: ApiError) -> anyhow::Error {
    if matches!(err, ApiError::Canceled) {
        anyhow::Error::new(RunCancelled)
    } else {
        err.into()
    }
}

/// A torn or unreadable state file degrades to an empty state; a bad tenant
/// id stays fatal (it would become a path segment).
fn load_state_tolerant(cache_dir: &Path, tenant_id: &str) -> Result<CacheState> {
    match rules::load_state(cache_dir, tenant_id) {
        Ok(state) => Ok(state),
        Err(err @ (RulesError::TenantEmpty | RulesError::TenantInvalid)) => Err(err.into()),
        Err(_) => Ok(CacheState::default()),
    }
}

/// Rules sync with the fatal-vs-fallback policy: every failure is fatal on
/// first run and degrades to the cached copy afterwards.
async fn sync_rules(
    api: &Api,
    cancel: &CancellationToken,
    ex: &ExchangeResp,
    cache_dir: &Path,
    root_pem: &[u8],
    log: &Logger,
) -> Result<CacheState> {
    let mut state = load_state_tolerant(cache_dir, &ex.tenant_id)?;
    let cache_usable =
        |state: &CacheState| !state.rules_version.is_empty() && rules::has_archive(&state.archive_path);

    match api
        .resolve_rules(cancel, &ex.access_token, &state.rules_version)
        .await
    {
        Err(ApiError::Canceled) => return Err(anyhow::Error::new(RunCancelled)),
        Err(_) => {
            if !cache_usable(&state) {
                bail!("规则中心不可达且首次运行无缓存");
            }
            log.info(&format!("规则中心不可达，继续使用本地规则（{}）", state.rules_version));
        }
        Ok(res) => {
            let need_download = !res.up_to_date
                || !rules::has_archive(&state.archive_path)
                || state.rules_version != res.rules_version;
            if need_download {
                match api.download(cancel, &ex.access_token, &res.download_url).await {
                    Err(ApiError::Canceled) => return Err(anyhow::Error::new(RunCancelled)),
                    Err(err) => {
                        if !cache_usable(&state) {
                            bail!("首次拉规则失败: {err}");
                        }
                        log.info(&format!(
                            "规则下载失败，继续使用本地规则（{}）",
                            state.rules_version
                        ));
                    }
                    Ok((data, got_sha)) => {
                        if got_sha != res.manifest_sha256 {
                            if !cache_usable(&state) {
                                bail!("首次拉规则 sha256 不匹配");
                            }
                            log.info(&format!(
                                "规则校验失败，继续使用本地规则（{}）",
                                state.rules_version
                            ));
                        } else {
                            let archive_path = rules::save_archive(
                                cache_dir,
                                &ex.tenant_id,
                                &res.rules_version,
                                &data,
                            )?;
                            match rules::verify_archive_signature(
                                cache_dir,
                                root_pem,
                                &archive_path,
                                &res.signature_base64,
                                &res.signing_public_key_path_in_archive,
                                &res.signing_public_key_signature_base64,
                            ) {
                                Err(err) => {
                                    if !cache_usable(&state) {
                                        bail!("首次拉规则签名校验失败: {err}");
                                    }
                                    log.info(&format!(
                                        "规则签名校验失败，继续使用本地规则（{}）",
                                        state.rules_version
                                    ));
                                }
                                Ok(()) => {
                                    state = CacheState {
                                        rules_version: res.rules_version.clone(),
                                        manifest_sha256: res.manifest_sha256.clone(),
                                        archive_path,
                                    };
                                    rules::save_state(cache_dir, &ex.tenant_id, &state)?;
                                    log.info(&format!(
                                        "规则中心：规则中心更新成功（{}）",
                                        res.rules_version
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    if !cache_usable(&state) {
        bail!("本地规则不可用");
    }
    Ok(state)
}

fn build_generate_tasks(files: &[RequirementFile], num: usize) -> Vec<GenerateTask> {
    let mut tasks = Vec::with_capacity(files.len() * num);
    let file_count = files.len();
    for file in files {
        for index in 1..=num {
            tasks.push(GenerateTask {
                file: file.clone(),
                label: task_display_label(file_count, num, &file.path, index),
            });
        }
    }
    tasks
}

fn task_display_label(file_count: usize, num: usize, path: &Path, index: usize) -> String {
    let base = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match (file_count > 1, num > 1) {
        (true, true) => format!("{base}#{index}"),
        (true, false) => base,
        (false, true) => format!("#{index}"),
        (false, false) => String::new(),
    }
}

async fn run_generate_task(
    ctx: &Arc<RunContext>,
    cancel: &CancellationToken,
    task: &GenerateTask,
) -> bool {
    let mut st = TaskState {
        ctx,
        cancel,
        task,
        job_id: String::new(),
        tenant: ctx.tenant_id.clone(),
        elapsed_ms: 0,
        trace_offset: 0,
        trace_warned: false,
        last_trace_line: String::new(),
    };

    let filename = task
        .file
        .path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let submitted = match ctx
        .api
        .generate(
            cancel,
            &ctx.access_token,
            &GenerateReq {
                input_markdown: task.file.content.clone(),
                input_filename: filename,
                candidate_count: 1,
            },
        )
        .await
    {
        Err(ApiError::Canceled) => {
            st.info("已取消");
            return false;
        }
        Err(err) => {
            st.info(&format!("生成失败：{err}"));
            return false;
        }
        Ok(resp) => resp,
    };
    ctx.registry.add(&submitted.job_id, &task.label);
    st.job_id = submitted.job_id;

    let deadline = Instant::now() + ctx.poll_timeout;
    loop {
        st.drain_trace().await;
        if Instant::now() > deadline {
            st.info("生成失败：轮询超时");
            return false;
        }
        let status = match ctx.api.job(cancel, &ctx.access_token, &st.job_id).await {
            Err(ApiError::Canceled) => {
                st.info("已取消");
                return false;
            }
            Err(err) => {
                st.info(&format!("生成失败：{err}"));
                return false;
            }
            Ok(status) => status,
        };
        match status.status.as_str() {
            "succeeded" => {
                st.drain_trace().await;
                return st.write_outputs().await;
            }
            "failed" => {
                st.drain_trace().await;
                st.info(&format!("生成失败：{}", status.error));
                return false;
            }
            "cancelled" => {
                st.drain_trace().await;
                st.info("生成已取消");
                return false;
            }
            _ => {
                if sleep(ctx.poll_interval).or_cancel(cancel).await.is_err() {
                    st.info("已取消");
                    return false;
                }
            }
        }
    }
}

/// Worker-local view of one task: identity for the log prefix plus the
/// trace cursor.
struct TaskState<'a> {
    ctx: &'a RunContext,
    cancel: &'a CancellationToken,
    task: &'a GenerateTask,
    job_id: String,
    tenant: String,
    elapsed_ms: i64,
    trace_offset: u64,
    trace_warned: bool,
    last_trace_line: String,
}

impl TaskState<'_> {
    fn info(&self, msg: &str) {
        self.ctx.log.info(&format!(
            "{} {msg}",
            task_prefix(&self.tenant, self.elapsed_ms, &self.task.label)
        ));
    }

    /// Pull up to three trace bursts. Non-verbose output dedups consecutive
    /// identical lines; fetch failures warn once per contiguous failure
    /// burst and a later success resets the suppression.
    async fn drain_trace(&mut self) {
        for _ in 0..TRACE_BURSTS_PER_DRAIN {
            let burst = match self
                .ctx
                .api
                .job_trace(
                    self.cancel,
                    &self.ctx.access_token,
                    &self.job_id,
                    self.trace_offset,
                    TRACE_PAGE_LIMIT,
                )
                .await
            {
                Err(err) => {
                    if self.ctx.verbose {
                        self.ctx.log.event(
                            "worker_trace_error",
                            json!({
                                "job_id": self.job_id,
                                "error": err.to_string(),
                                "task": self.task.label,
                            }),
                        );
                    } else if !self.trace_warned {
                        self.trace_warned = true;
                        self.info(&format!("过程拉取失败，继续执行：{err}"));
                    }
                    return;
                }
                Ok(burst) => burst,
            };
            self.trace_warned = false;
            self.trace_offset = burst.next_offset;
            if burst.items.is_empty() {
                return;
            }
            for item in &burst.items {
                if !item.tenant_id.trim().is_empty() {
                    self.tenant = item.tenant_id.clone();
                }
                if item.elapsed_ms >= 0 {
                    self.elapsed_ms = item.elapsed_ms;
                }
                if self.ctx.verbose {
                    if should_skip_verbose_worker_trace(item) {
                        continue;
                    }
                    self.ctx.log.event(
                        "worker_trace",
                        json!({
                            "job_id": item.job_id,
                            "tenant_id": item.tenant_id,
                            "ts": item.ts,
                            "elapsed_ms": item.elapsed_ms,
                            "source": item.source,
                            "event_name": item.event,
                            "level": item.level,
                            "req_id": item.req_id,
                            "payload": item.payload,
                            "task": self.task.label,
                        }),
                    );
                }
                let msg = render_worker_trace_line(item, !self.ctx.verbose);
                if msg.trim().is_empty() {
                    continue;
                }
                if !self.ctx.verbose {
                    if msg == self.last_trace_line {
                        continue;
                    }
                    self.last_trace_line = msg.clone();
                }
                self.info(&msg);
            }
            if !burst.has_more {
                return;
            }
        }
    }

    async fn write_outputs(&mut self) -> bool {
        let ctx = self.ctx;
        let result = match ctx.api.result(self.cancel, &ctx.access_token, &self.job_id).await {
            Err(err) => {
                self.info(&format!("生成失败：读取结果失败: {err}"));
                return false;
            }
            Ok(result) => result,
        };
        let (_, en_path, cn_path) = match output::unique_pair(&ctx.output_dir, &self.task.file.path)
        {
            Err(err) => {
                self.info(&format!("生成失败：输出文件名失败: {err}"));
                return false;
            }
            Ok(triple) => triple,
        };
        if let Err(err) = std::fs::write(&en_path, result.en_markdown.as_bytes()) {
            self.info(&format!("生成失败：写 EN 失败: {err}"));
            return false;
        }
        if let Err(err) = std::fs::write(&cn_path, result.cn_markdown.as_bytes()) {
            self.info(&format!("生成失败：写 CN 失败: {err}"));
            return false;
        }
        self.info(&format!("EN 已写入：{}", display_abs(&en_path)));
        self.info(&format!("CN 已写入：{}", display_abs(&cn_path)));

        let en_docx_target = en_path.with_extension("docx");
        let en_docx = match ctx
            .converter
            .convert(self.cancel, &en_path, &en_docx_target, &result.meta.highlight_words_en)
            .await
        {
            Err(err) => {
                self.info(&format!("生成失败：EN Word 转换失败: {err}"));
                return false;
            }
            Ok(path) => path,
        };
        let cn_docx_target = cn_path.with_extension("docx");
        let cn_docx = match ctx
            .converter
            .convert(self.cancel, &cn_path, &cn_docx_target, &result.meta.highlight_words_cn)
            .await
        {
            Err(err) => {
                self.info(&format!("生成失败：CN Word 转换失败: {err}"));
                return false;
            }
            Ok(path) => path,
        };
        self.info(&format!("EN Word 已写入：{}", display_abs(&en_docx)));
        self.info(&format!("CN Word 已写入：{}", display_abs(&cn_docx)));
        true
    }
}

/// One-shot cancel sweep over the submitted-job registry. Triggered both by
/// the token watcher and by the main flow after the pool drains; the
/// `started` guard collapses every trigger into a single pass and `done`
/// lets the main flow wait for it.
struct CancelSweep {
    ctx: Arc<RunContext>,
    started: AtomicBool,
    done_tx: watch::Sender<bool>,
}

impl CancelSweep {
    fn new(ctx: Arc<RunContext>) -> (Arc<Self>, watch::Receiver<bool>) {
        let (done_tx, done_rx) = watch::channel(false);
        (
            Arc::new(Self {
                ctx,
                started: AtomicBool::new(false),
                done_tx,
            }),
            done_rx,
        )
    }

    fn trigger(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let sweep = Arc::clone(self);
        tokio::spawn(async move {
            sweep.run().await;
            let _ = sweep.done_tx.send(true);
        });
    }

    async fn run(&self) {
        let jobs = self.ctx.registry.snapshot();
        if jobs.is_empty() {
            return;
        }
        self.ctx
            .log
            .info(&format!("检测到中断，开始取消已提交任务（{}）", jobs.len()));

        // The main token is already cancelled; the sweep gets its own
        // deadline instead.
        let deadline = CancellationToken::new();
        tokio::spawn({
            let deadline = deadline.clone();
            async move {
                sleep(CANCEL_SWEEP_DEADLINE).await;
                deadline.cancel();
            }
        });

        let sem = Arc::new(Semaphore::new(CANCEL_SWEEP_PERMITS));
        let mut join = JoinSet::new();
        for job in jobs {
            let ctx = Arc::clone(&self.ctx);
            let sem = Arc::clone(&sem);
            let deadline = deadline.clone();
            join.spawn(async move {
                let Ok(Ok(_permit)) = sem.clone().acquire_owned().or_cancel(&deadline).await else {
                    return false;
                };
                match ctx.api.cancel_job(&deadline, &ctx.access_token, &job.job_id).await {
                    Err(err) => {
                        ctx.log.info(&format!(
                            "{} 取消失败：{err}",
                            task_prefix(&ctx.tenant_id, 0, &job.label)
                        ));
                        false
                    }
                    Ok(resp) => {
                        if resp.cancelled || resp.status.eq_ignore_ascii_case("cancelled") {
                            ctx.log.info(&format!(
                                "{} 已取消（job_id={}）",
                                task_prefix(&ctx.tenant_id, 0, &job.label),
                                job.job_id
                            ));
                        } else {
                            ctx.log.info(&format!(
                                "{} 已提交取消请求（job_id={}）",
                                task_prefix(&ctx.tenant_id, 0, &job.label),
                                job.job_id
                            ));
                        }
                        true
                    }
                }
            });
        }
        let mut ok = 0_i64;
        let mut failed = 0_i64;
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(true) => ok += 1,
                _ => failed += 1,
            }
        }
        self.ctx
            .log
            .info(&format!("取消完成：成功 {ok}，失败 {failed}"));
    }
}

fn display_abs(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn req(path: &str) -> RequirementFile {
        RequirementFile {
            path: PathBuf::from(path),
            content: "body".to_string(),
        }
    }

    #[test]
    fn label_matrix() {
        assert_eq!(task_display_label(2, 2, Path::new("dir/a.md"), 1), "a.md#1");
        assert_eq!(task_display_label(2, 1, Path::new("dir/a.md"), 1), "a.md");
        assert_eq!(task_display_label(1, 2, Path::new("dir/a.md"), 2), "#2");
        assert_eq!(task_display_label(1, 1, Path::new("dir/a.md"), 1), "");
    }

    #[test]
    fn tasks_cross_files_with_replicas() {
        let files = vec![req("a.md"), req("b.md")];
        let tasks = build_generate_tasks(&files, 2);
        let labels: Vec<&str> = tasks.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, vec!["a.md#1", "a.md#2", "b.md#1", "b.md#2"]);
    }

    #[test]
    fn registry_ignores_blank_ids_and_dedups() {
        let registry = SubmittedJobs::default();
        registry.add("  ", "x");
        registry.add("job_1", "a");
        registry.add("job_1", "b");
        registry.add("job_2", "c");
        let mut ids: Vec<String> = registry.snapshot().into_iter().map(|j| j.job_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["job_1".to_string(), "job_2".to_string()]);
    }
}
