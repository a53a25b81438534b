use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use casrv::{Catalog, MemoryServer};
use casrv_server::{CaServer, CircuitListener, ServerConfig};

use crate::cmd::ServeArgs;
use crate::exit::{catalog_error, server_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::{print_listening, OutputFormat};

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let catalog = match &args.pvs {
        Some(path) => Catalog::from_path(path).map_err(catalog_error)?,
        None => {
            tracing::warn!("no catalogue given; every claim will fail");
            Catalog::default()
        }
    };
    let provider = Arc::new(MemoryServer::from_catalog(&catalog).map_err(catalog_error)?);

    let config = ServerConfig::default()
        .with_max_array_bytes(args.max_array_bytes)
        .with_write_timeout(Some(parse_duration(&args.write_timeout)?))
        .with_dump_requests(args.dump_requests);
    let server = CaServer::new(config, provider.clone());
    provider.bind(&server);

    let addr = format!("{}:{}", args.bind, args.port);
    let mut listener =
        CircuitListener::bind(&addr, server).map_err(|err| server_error("bind failed", err))?;
    install_ctrlc_handler(listener.shutdown_handle())?;

    print_listening(listener.local_addr(), provider.len(), format);
    tracing::info!(address = %listener.local_addr(), pvs = provider.len(), "serving");

    let accepted = listener
        .serve()
        .map_err(|err| server_error("accept failed", err))?;
    tracing::info!(circuits = accepted, "server stopped");
    Ok(SUCCESS)
}

fn install_ctrlc_handler(shutdown: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert_eq!(parse_duration("0s").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("soon").unwrap_err().code, USAGE);
        assert_eq!(parse_duration("").unwrap_err().code, USAGE);
    }
}
