use std::{path::Path, process, sync::Arc};

use axum::http::Method;
use serde::Serialize;
use serde_json::{Value, json};
use sitecache::{
    admission::{AdmissionEngine, RequestContext, parse_cookie_header},
    cache::{CacheTrigger, OutputFormat, PageCacheEngine, RequestState, StoreUsage},
    config::{self, CheckArgs, Command, InvalidateArgs, Settings},
    error::AppError,
    infra::{error::InfraError, telemetry},
    object_cache::{ObjectCache, ObjectCacheStats},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::PurgeUrl(args) => {
            let engine = page_engine(&settings)?;
            let removed = engine.purge_url(&args.url)?;
            info!(url = %args.url, removed, "Purged URL");
            print_json(&json!({ "url": args.url, "removed": removed }))
        }
        Command::Invalidate(args) => run_invalidate(&settings, &args),
        Command::PurgeAll => {
            let engine = page_engine(&settings)?;
            let removed = engine.invalidate_all();
            info!(removed, "Purged page cache");
            print_json(&json!({ "removed": removed }))
        }
        Command::Prune => {
            let engine = page_engine(&settings)?;
            let removed = engine.prune()?;
            info!(removed, "Pruned stale pages");
            print_json(&json!({ "removed": removed }))
        }
        Command::Stats => {
            let engine = page_engine(&settings)?;
            let usage = engine.usage()?;
            let objects = ObjectCache::new(settings.object_cache.clone());
            print_json(&stats_report(&engine.config().root, &usage, &objects.stats()))
        }
        Command::Check(args) => run_check(&settings, &args),
        Command::Probe => {
            let objects = ObjectCache::new(settings.object_cache.clone());
            print_json(&json!({
                "configured": settings.object_cache.backend,
                "selected": objects.backend_kind(),
                "backend_stats": objects.stats().backend_stats,
            }))
        }
    }
}

fn page_engine(settings: &Settings) -> Result<PageCacheEngine, AppError> {
    let root = &settings.page_cache.root;
    if root.exists() && !root.is_dir() {
        return Err(InfraError::configuration(format!(
            "page cache root `{}` is not a directory",
            root.display()
        ))
        .into());
    }
    let admission = Arc::new(AdmissionEngine::new(settings.admission.clone()));
    Ok(PageCacheEngine::new(settings.page_cache.clone(), admission))
}

fn run_invalidate(settings: &Settings, args: &InvalidateArgs) -> Result<(), AppError> {
    let trigger = CacheTrigger::from_engine(Arc::new(page_engine(settings)?));
    let published = if args.term {
        trigger.on_term_changed(args.id)
    } else if args.deleted {
        trigger.on_content_deleted(args.id)
    } else {
        trigger.on_content_changed(args.id)
    };
    // A one-shot command consumes its own event even when consumption is deferred.
    let report = published.unwrap_or_else(|| trigger.flush());
    info!(
        id = args.id,
        term = args.term,
        deleted = args.deleted,
        removed = report.removed,
        "Invalidated dependent pages"
    );
    print_json(&json!({
        "id": args.id,
        "kind": if args.term { "term" } else { "content" },
        "events": report.events,
        "removed": report.removed,
    }))
}

/// State that outlives this process: entries on disk and what the backend reports.
///
/// Hit and miss counters are per process and always zero in a one-shot command.
fn stats_report(root: &Path, usage: &StoreUsage, objects: &ObjectCacheStats) -> Value {
    json!({
        "page_cache": {
            "root": root,
            "entries": usage.entries,
            "bytes": usage.bytes,
        },
        "object_cache": {
            "backend": objects.backend,
            "backend_stats": objects.backend_stats,
        },
    })
}

fn run_check(settings: &Settings, args: &CheckArgs) -> Result<(), AppError> {
    let method = Method::from_bytes(args.method.to_ascii_uppercase().as_bytes())
        .map_err(|err| AppError::validation(format!("invalid method `{}`: {err}", args.method)))?;
    let mut context = RequestContext::from_url(method, &args.url)
        .ok_or_else(|| AppError::validation(format!("`{}` is not an absolute URL", args.url)))?
        .with_ajax(args.ajax);
    for cookie in &args.cookies {
        context.cookies.extend(parse_cookie_header(cookie));
    }
    if let Some(user_agent) = args.user_agent.as_deref() {
        context = context.with_user_agent(user_agent);
    }
    if let Some(referrer) = args.referrer.as_deref() {
        context = context.with_referrer(referrer);
    }
    if let Some(ip) = args.client_ip {
        context = context.with_client_ip(ip);
    }
    if let Some(role) = args.role.as_deref() {
        context = context.with_role(role);
    }

    let engine = page_engine(settings)?;
    let format = OutputFormat::detect(&context.path, None);
    let report = match engine.begin(&context, format) {
        RequestState::Cacheable { key, fingerprint } => json!({
            "cacheable": true,
            "key": key.to_string(),
            "fingerprint": fingerprint.to_string(),
            "file": engine.store().root().join(fingerprint.bucket()).join(fingerprint.file_name()),
        }),
        RequestState::NotCacheable(reason) => json!({
            "cacheable": false,
            "reason": reason.to_string(),
        }),
    };
    print_json(&report)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
