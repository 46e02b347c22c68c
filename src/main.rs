use clap::Parser;
use std::{process, sync::Arc};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod cli;
mod error;
mod execution;
mod gsql;
mod http;
mod output;
mod settings;
mod task;
mod token;
mod util;

use cli::Cli;
use error::Result;
use execution::{TaskContext, TaskRunner};
use http::ReqwestTransport;
use settings::Settings;
use task::{DependencyGraph, load_tasks, print_task_list, show_task_relationships};

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(args.verbose);

    if let Err(e) = run_graphload(args).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "graphload=debug" } else { "graphload=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_graphload(args: Cli) -> Result<()> {
    let config = load_tasks(&args.file, &args.properties)?;
    let registry = config.registry;
    debug!("Loaded {} tasks from {}", registry.len(), args.file);

    if args.list {
        print_task_list(&registry);
        return Ok(());
    }

    let graph = DependencyGraph::build(&registry)?;
    show_task_relationships(&registry, &graph, args.verbose);

    let roots: Vec<String> = if !args.tasks.is_empty() {
        args.tasks.clone()
    } else if let Some(default) = &config.default_task {
        vec![default.clone()]
    } else {
        println!("No task given and no default task configured. Available tasks:\n");
        print_task_list(&registry);
        return Ok(());
    };

    for root in &roots {
        registry.get(root)?;
    }

    let segments = graph.topo_segments(&roots)?;
    let order = segments.concat();
    info!("Task execution order: {}", order.join(" -> "));

    if args.dry_run {
        let graph_name = config
            .properties
            .get(settings::GRAPH_NAME)
            .map(String::as_str)
            .unwrap_or("<graph>");
        println!("Dry run mode - showing what would be executed:");
        for task_id in &order {
            let task = registry.get(task_id)?;
            println!("  {} would run: {}", task.name, task.describe(graph_name));
        }
        return Ok(());
    }

    let settings = Arc::new(Settings::from_properties(&config.properties, &config.options)?);
    let transport = Arc::new(ReqwestTransport::new(&settings)?);
    let context = Arc::new(TaskContext::new(
        Arc::clone(&settings),
        transport,
        args.output.unwrap_or_default(),
    ));

    let workers = args.workers.or(config.workers);
    let runner = TaskRunner::new(&registry, &graph, context, workers, args.continue_on_failure);
    let report = runner.run_segments(&segments).await;

    if report.is_success() {
        info!("{}", report.summary());
        return Ok(());
    }

    eprintln!("{}", report.summary());
    report.into_result()
}
