use anyhow::{Context, Result};
use lezhiquan::api_client::{CouponDirectory, ProxyClient};
use lezhiquan::cleanup::sweep_stale_records;
use lezhiquan::commands::CommandRouter;
use lezhiquan::config::{RuntimeFiles, load_app_config, resolve_config_dir, strip_config_dir_args};
use lezhiquan::dispatch::{DispatchEvent, DispatchExecutor, render_outcome};
use lezhiquan::login::{
    CachedCredentialProvider, CredentialProvider, ON_VALIDATION_ERROR, SessionCache,
};
use lezhiquan::models::{ActivityForm, AppConfig, Coupon, ScmCredentials};
use lezhiquan::shared_state::{FirebaseStore, MemoryStore, SharedStateStore};
use lezhiquan::sharing::{SharingController, SharingView};
use lezhiquan::utils::now_millis;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const USAGE: &str = "用法: lezhiquan [--config-dir <目录>] <命令>
  login <providerId> <sessionId> [用户名]   导入 SCM 会话
  validate                                 校验缓存的 SCM 会话
  search <关键字>                          搜索优惠券
  share <券ID> [status|on|off|reset|delete|update <关键字>]
  activities                               列出正在共享的券（@活动）
  gift <消息>                              例: gift 送3000/98折给 S001 S002
  sweep                                    清理 60 天未更新的共享记录";

struct Services {
    config: AppConfig,
    proxy: Arc<ProxyClient>,
    credentials: Arc<CachedCredentialProvider>,
    store: Arc<dyn SharedStateStore>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run_app().await {
        eprintln!("执行失败: {err:#}");
        std::process::exit(1);
    }
}

async fn run_app() -> Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let files = RuntimeFiles::new(resolve_config_dir(&argv));
    let config = load_app_config(&files.config_file)?;
    init_logger(&config.logging.level, &files.log_path(&config))?;
    tracing::info!("配置目录: {}", files.config_dir.display());

    let args = strip_config_dir_args(&argv);
    let Some((command, rest)) = args.split_first() else {
        println!("{USAGE}");
        return Ok(());
    };

    let services = build_services(&files, config)?;
    match command.as_str() {
        "login" => import_session(&services, rest).await,
        "validate" => validate_session(&services).await,
        "search" => search(&services, &rest.join(" ")).await,
        "share" => share(&services, rest).await,
        "activities" => chat(&services, "@活动").await,
        "gift" => chat(&services, &rest.join(" ")).await,
        "sweep" => sweep(&services).await,
        other => {
            println!("未知命令: {other}\n{USAGE}");
            Ok(())
        }
    }
}

fn build_services(files: &RuntimeFiles, config: AppConfig) -> Result<Services> {
    let proxy = Arc::new(ProxyClient::new(&config.api).with_context(|| "创建代理接口客户端失败")?);
    let cache = SessionCache::load(files.session_file.clone())?;
    let credentials = Arc::new(CachedCredentialProvider::new(cache));
    let store: Arc<dyn SharedStateStore> = if config.firebase.database_url.trim().is_empty() {
        tracing::warn!("未配置 firebase.database_url，共享状态仅保存在本进程内存");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            FirebaseStore::new(&config.firebase, config.api.timeout)
                .with_context(|| "创建 Firebase 客户端失败")?,
        )
    };
    Ok(Services {
        config,
        proxy,
        credentials,
        store,
    })
}

async fn provider_id(services: &Services) -> Result<String> {
    let configured = services.config.firebase.provider_id.trim();
    if !configured.is_empty() {
        return Ok(configured.to_string());
    }
    services
        .credentials
        .scm_credentials()
        .await
        .map(|c| c.provider_id)
        .with_context(|| "未登录 SCM，且未配置 firebase.provider_id")
}

async fn import_session(services: &Services, rest: &[String]) -> Result<()> {
    let (Some(provider_id), Some(session_id)) = (rest.first(), rest.get(1)) else {
        anyhow::bail!("login 需要 providerId 和 sessionId");
    };
    let credentials = ScmCredentials {
        provider_id: provider_id.clone(),
        session_id: session_id.clone(),
        user_name: rest.get(2).cloned().unwrap_or_default(),
        expires_at: None,
    };
    services
        .credentials
        .store(credentials, services.config.login.session_ttl_hours)
        .await?;
    println!("已保存 SCM 会话: {provider_id}");
    Ok(())
}

async fn validate_session(services: &Services) -> Result<()> {
    match services
        .credentials
        .validate_cached(services.proxy.as_ref(), ON_VALIDATION_ERROR)
        .await
    {
        Some(credentials) => println!("SCM 会话有效: provider={}", credentials.provider_id),
        None => println!("SCM 会话无效，请重新登录"),
    }
    Ok(())
}

async fn search(services: &Services, keyword: &str) -> Result<()> {
    let directory = CouponDirectory::new(
        services.proxy.clone(),
        services.credentials.clone(),
        services.config.api.page_size,
    );
    let coupons = directory.search(keyword).await.map_err(|e| anyhow::anyhow!(e.toast()))?;
    if coupons.is_empty() {
        println!("没有找到优惠券");
    }
    for coupon in coupons {
        println!(
            "{}\t{}\t{}\t{} ~ {}",
            coupon.id,
            coupon.name,
            coupon.summary(),
            coupon.begin_time,
            coupon.end_time
        );
    }
    Ok(())
}

/// 按 id 查券；列表里查不到时只用 id 打开
async fn find_coupon(services: &Services, coupon_id: &str) -> Result<Coupon> {
    let directory = CouponDirectory::new(
        services.proxy.clone(),
        services.credentials.clone(),
        services.config.api.page_size,
    );
    let found = directory
        .search(coupon_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.toast()))?
        .into_iter()
        .find(|c| c.id == coupon_id);
    Ok(found.unwrap_or_else(|| Coupon {
        id: coupon_id.to_string(),
        name: String::new(),
        coupon_type: 0,
        min_pay: None,
        discount: None,
        price: None,
        begin_time: String::new(),
        end_time: String::new(),
        note: String::new(),
    }))
}

async fn share(services: &Services, rest: &[String]) -> Result<()> {
    let Some(coupon_id) = rest.first() else {
        anyhow::bail!("share 需要券ID");
    };
    let action = rest.get(1).map(String::as_str).unwrap_or("status");
    let coupon = find_coupon(services, coupon_id).await?;
    let controller = SharingController::new(
        services.proxy.clone(),
        services.store.clone(),
        services.credentials.clone(),
        services.config.sharing.clone(),
    );
    let provider_id = provider_id(services).await?;
    let session = controller
        .open(&provider_id, coupon)
        .await
        .map_err(|e| anyhow::anyhow!(e.toast()))?;

    let current = session.view().map_err(|e| anyhow::anyhow!(e.toast()))?;
    let result = match action {
        "status" => Ok(current),
        "on" | "off" => {
            if current.active == (action == "on") {
                Ok(current)
            } else {
                session.toggle().await
            }
        }
        "reset" => session.reset().await,
        "delete" => session.delete().await,
        "update" => {
            let Some(keyword) = rest.get(2) else {
                anyhow::bail!("update 需要关键字");
            };
            let form = ActivityForm {
                keyword: keyword.clone(),
                ..current.form.clone()
            };
            session.update(form).await
        }
        other => anyhow::bail!("未知的 share 操作: {other}"),
    };
    session.close();
    let view = result.map_err(|e| anyhow::anyhow!(e.toast()))?;
    print_view(&view);
    Ok(())
}

fn print_view(view: &SharingView) {
    println!(
        "券 {} {}: {}",
        view.coupon_id,
        view.coupon_name,
        if view.active { "共享中" } else { "未共享" }
    );
    println!("  关键字: {}", view.keyword);
    println!(
        "  活动: {} (共 {} 个)",
        view.activity_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "无".to_string()),
        view.activity_count
    );
    println!(
        "  每店 {} 张, 总量 {}, {} ~ {}",
        view.form.coupon_num,
        view.form.coupon_amount,
        view.form.begin_time_date,
        view.form.end_time_date
    );
    if view.active != view.remote_flag {
        println!("  注意: 共享记录标记为 {}，与活动状态不一致", view.remote_flag);
    }
}

async fn chat(services: &Services, text: &str) -> Result<()> {
    let provider_id = provider_id(services).await?;
    let dispatcher = Arc::new(
        DispatchExecutor::new(
            services.proxy.clone(),
            services.credentials.clone(),
            services.config.dispatch.clone(),
        )
        .with_issued_tracking(services.store.clone(), provider_id.clone()),
    );
    let router = CommandRouter::new(services.store.clone(), provider_id, dispatcher);
    let reply = router
        .handle(text, |event| match event {
            DispatchEvent::Sending {
                index,
                total,
                coupon,
            } => println!("正在发送 {index}/{total}: {}", coupon.keyword),
            DispatchEvent::Finished {
                coupon, outcome, ..
            } => println!("{}", render_outcome(&coupon, &outcome)),
        })
        .await
        .map_err(|e| anyhow::anyhow!(e.toast()))?;
    match reply {
        Some(text) => println!("{text}"),
        None => println!("不是可识别的指令: {text}"),
    }
    Ok(())
}

async fn sweep(services: &Services) -> Result<()> {
    let provider_id = provider_id(services).await?;
    let removed = sweep_stale_records(
        services.store.as_ref(),
        &provider_id,
        now_millis(),
        services.config.sharing.stale_days,
    )
    .await
    .map_err(|e| anyhow::anyhow!(e.toast()))?;
    println!("已清理 {removed} 条过期共享记录");
    Ok(())
}

fn init_logger(level: &str, log_path: &Path) -> Result<()> {
    let directive = match level.to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "WARN" => "warn",
        "ERROR" => "error",
        _ => "info",
    };
    let env_filter = EnvFilter::try_new(directive).with_context(|| "初始化日志级别失败")?;
    let log_dir = log_path
        .parent()
        .filter(|item| !item.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("创建日志目录失败: {}", log_dir.display()))?;
    let log_file_name = log_path
        .file_name()
        .and_then(|item| item.to_str())
        .filter(|item| !item.trim().is_empty())
        .unwrap_or("lezhiquan.log");

    let file_appender = tracing_appender::rolling::never(log_dir, log_file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    Box::leak(Box::new(guard));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .with_context(|| "初始化日志订阅器失败")?;

    tracing::debug!("日志文件: {}", log_path.display());
    Ok(())
}
