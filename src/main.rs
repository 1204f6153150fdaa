use clap::Parser;
use tablepipe_lib::data_transfer::connection_resolver::{resolve_request, InstanceDirectory};
use tablepipe_lib::data_transfer::models::TransferJobSpec;
use tablepipe_lib::{CliArgs, PipeTransfer, TransferConfig, TransferReport};

async fn run(args: CliArgs) -> Result<bool, String> {
    let (mut config, directory) = match &args.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config '{}': {}", path, e))?;
            (
                TransferConfig::from_json(&contents)
                    .map_err(|e| format!("Invalid config '{}': {}", path, e))?,
                InstanceDirectory::from_json(&contents)?,
            )
        }
        None => (TransferConfig::default(), InstanceDirectory::default()),
    };
    config.apply_env_overrides()?;
    config.merge_cli(&args);
    config.validate()?;

    let job = TransferJobSpec::from_file(&args.job)?;
    let request = resolve_request(&directory, &directory, &job, &args.user)?;

    log::info!(
        "Transferring {} ({}) -> {} ({}) via gpfdist at {}",
        request.source,
        request.source_connection.endpoint_label(),
        request.destination,
        request.destination_connection.endpoint_label(),
        config.streaming.host
    );

    let report = TransferReport::start(&request);
    let outcome = PipeTransfer::with_postgres(config).run(&request).await;
    let succeeded = outcome.is_succeeded();
    let report = report.finish(&outcome);

    let rendered = serde_json::to_string_pretty(&report)
        .map_err(|e| format!("Failed to render report: {}", e))?;
    println!("{}", rendered);
    Ok(succeeded)
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = CliArgs::parse();

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }
}
