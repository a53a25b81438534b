use std::io::{IsTerminal, Write};
use std::net::SocketAddr;

use casrv::PvDefinition;
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PvRow<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    field_type: &'a str,
    count: u32,
    access: &'static str,
    value: String,
}

impl<'a> PvRow<'a> {
    fn from_definition(pv: &'a PvDefinition) -> Self {
        Self {
            name: &pv.name,
            field_type: &pv.field_type,
            count: pv.count,
            access: access_text(pv),
            value: pv
                .value
                .as_ref()
                .map_or_else(|| "-".to_string(), ToString::to_string),
        }
    }
}

#[derive(Serialize)]
struct PvListing<'a> {
    schema_id: &'static str,
    pvs: Vec<PvRow<'a>>,
}

pub fn print_pvs(pvs: &[PvDefinition], format: OutputFormat) {
    let rows: Vec<PvRow<'_>> = pvs.iter().map(PvRow::from_definition).collect();
    match format {
        OutputFormat::Json => {
            let listing = PvListing {
                schema_id: "https://schemas.3leaps.dev/casrv/cli/v1/pv-listing.schema.json",
                pvs: rows,
            };
            println!(
                "{}",
                serde_json::to_string(&listing).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["NAME", "TYPE", "COUNT", "ACCESS", "VALUE"]);
            for row in rows {
                table.add_row(vec![
                    row.name.to_string(),
                    row.field_type.to_string(),
                    row.count.to_string(),
                    row.access.to_string(),
                    row.value,
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for row in rows {
                println!(
                    "{} type={} count={} access={} value={}",
                    row.name, row.field_type, row.count, row.access, row.value
                );
            }
        }
        OutputFormat::Raw => {
            for row in rows {
                println!("{}", row.name);
            }
        }
    }
}

#[derive(Serialize)]
struct Listening {
    schema_id: &'static str,
    address: String,
    pvs: usize,
}

/// Announce the bound address. Flushed so a supervising process sees it
/// before the first circuit arrives.
pub fn print_listening(addr: SocketAddr, pvs: usize, format: OutputFormat) {
    let mut out = std::io::stdout();
    let line = match format {
        OutputFormat::Json => serde_json::to_string(&Listening {
            schema_id: "https://schemas.3leaps.dev/casrv/cli/v1/listening.schema.json",
            address: addr.to_string(),
            pvs,
        })
        .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Raw => addr.to_string(),
        OutputFormat::Table | OutputFormat::Pretty => {
            format!("casrv listening on {addr} ({pvs} process variables)")
        }
    };
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn access_text(pv: &PvDefinition) -> &'static str {
    match (pv.read, pv.write, pv.writers.is_some()) {
        (true, true, false) => "rw",
        (true, true, true) => "rw (restricted)",
        (true, false, _) => "r",
        (false, true, _) => "w",
        (false, false, _) => "-",
    }
}
