use std::{process, sync::Arc, time::Duration};

use serde_json::Value;
use shopdesk::{
    application::error::AppError,
    config::{self, Command, GetArgs, ResourceArgs, WatchArgs},
    infra::{
        error::InfraError,
        http::{ApiClient, resource_key},
        telemetry,
    },
    query::{QueryClient, QueryObserver},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let causes = error.chain();
    if dispatcher::has_been_set() {
        error!(error = %error, causes = ?causes, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, causes = ?causes, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let api = ApiClient::new(&settings.api).map_err(InfraError::from)?;
    let client = QueryClient::<Value>::new(settings.query.clone());
    info!(
        base_url = %api.base_url(),
        stale_time_ms = settings.query.stale_time_ms,
        cache_time_ms = settings.query.cache_time_ms,
        "Query client ready"
    );

    match cli_args.command {
        Command::Get(args) => run_get(&client, &api, args).await,
        Command::Watch(args) => run_watch(&client, &api, args).await,
    }
}

fn observe_resource(
    client: &QueryClient<Value>,
    api: &ApiClient,
    resource: &ResourceArgs,
) -> QueryObserver<Value> {
    let key = resource_key(&resource.path, &resource.params);
    client.observe_with(
        key,
        api.fetcher(&resource.path, &resource.params),
        client.default_options(),
    )
}

async fn run_get(
    client: &QueryClient<Value>,
    api: &ApiClient,
    args: GetArgs,
) -> Result<(), AppError> {
    let observer = observe_resource(client, api, &args.resource);
    let state = observer.settled().await;

    if let Some(error) = state.error {
        return Err(error.into());
    }
    match state.data {
        Some(data) => print_json(&data),
        None => Err(AppError::unexpected("fetch settled without data")),
    }
}

async fn run_watch(
    client: &QueryClient<Value>,
    api: &ApiClient,
    args: WatchArgs,
) -> Result<(), AppError> {
    if args.interval_seconds == 0 {
        return Err(AppError::validation("--interval-seconds must be at least 1"));
    }

    let observer = observe_resource(client, api, &args.resource);
    let mut changes = observer.watch();
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_seconds));
    ticker.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut last: Option<Arc<Value>> = None;
    let mut refetches: u64 = 0;

    info!(
        query_key = %observer.key(),
        interval_seconds = args.interval_seconds,
        count = ?args.count,
        "Watching resource"
    );

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = changes.borrow_and_update().clone();
                if let Some(error) = &state.error {
                    warn!(query_key = %observer.key(), error = %error, "Refetch failed");
                }
                if let Some(data) = state.data
                    && last.as_deref() != Some(data.as_ref())
                {
                    print_json(&data)?;
                    last = Some(data);
                }
            }
            _ = ticker.tick() => {
                if args.count.is_some_and(|max| refetches >= max) {
                    break;
                }
                refetches += 1;
                if let Err(error) = observer.refetch().await {
                    info!(
                        query_key = %observer.key(),
                        error = %error,
                        refetches,
                        "Refetch settled with error"
                    );
                }
            }
            _ = &mut shutdown => {
                info!("Interrupted");
                break;
            }
        }
    }

    observer.detach();
    Ok(())
}

fn print_json(value: &Value) -> Result<(), AppError> {
    let out = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{out}");
    Ok(())
}
