use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use charge_orchestrator::adapters::db::{SqliteStore, table_names};
use charge_orchestrator::app::services::billing::{BillingService, CreateTariffRequest};
use charge_orchestrator::domain::models::TariffScope;
use charge_orchestrator::domain::session_state::SystemClock;
use rust_decimal::Decimal;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PATH: &str = "./data/orchestrator.db";

/// Global AC/DC kWh prices for a tariff valid from now on.
#[derive(Debug, Clone, Copy)]
struct SeedTariff {
    price_ac_kwh: Decimal,
    price_dc_kwh: Decimal,
}

#[derive(Debug)]
struct Options {
    path: PathBuf,
    replace_existing: bool,
    seed: Option<SeedTariff>,
}

fn main() {
    let options = match parse_options(std::env::args().skip(1)) {
        Ok(Some(options)) => options,
        Ok(None) => {
            print_usage();
            return;
        }
        Err(message) => {
            eprintln!("create_db: {message}");
            print_usage();
            std::process::exit(2);
        }
    };

    if let Err(message) = prepare(&options) {
        eprintln!("create_db: {message}");
        std::process::exit(1);
    }
}

fn parse_options(mut args: impl Iterator<Item = String>) -> Result<Option<Options>, String> {
    let mut options = Options {
        path: PathBuf::from(DEFAULT_PATH),
        replace_existing: false,
        seed: None,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--path" => {
                options.path = args
                    .next()
                    .map(PathBuf::from)
                    .ok_or("--path expects a file")?;
            }
            "--force" => options.replace_existing = true,
            "--seed-tariff" => {
                let prices = args.next().ok_or("--seed-tariff expects AC_PRICE,DC_PRICE")?;
                options.seed = Some(parse_seed(&prices)?);
            }
            "--help" | "-h" => return Ok(None),
            other => return Err(format!("unexpected argument {other}")),
        }
    }

    Ok(Some(options))
}

fn parse_seed(prices: &str) -> Result<SeedTariff, String> {
    let (ac, dc) = prices
        .split_once(',')
        .ok_or_else(|| format!("seed prices must look like 0.39,0.59, got {prices}"))?;
    let parse = |text: &str| {
        text.trim()
            .parse::<Decimal>()
            .map_err(|error| format!("invalid price {text}: {error}"))
    };

    Ok(SeedTariff {
        price_ac_kwh: parse(ac)?,
        price_dc_kwh: parse(dc)?,
    })
}

fn prepare(options: &Options) -> Result<(), String> {
    if options.replace_existing && options.path.exists() {
        std::fs::remove_file(&options.path)
            .map_err(|error| format!("cannot remove {}: {error}", options.path.display()))?;
    }
    if let Some(dir) = options.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .map_err(|error| format!("cannot create {}: {error}", dir.display()))?;
    }

    let path = options.path.to_string_lossy();
    let store = SqliteStore::open(&path, BUSY_TIMEOUT).map_err(|error| error.to_string())?;
    let version = store.schema_version().map_err(|error| error.to_string())?;
    let tables = store
        .read(table_names)
        .map_err(|error| error.to_string())?;

    println!("database: {path}");
    println!("schema version: {version}");
    println!("tables: {}", tables.join(", "));

    if let Some(seed) = options.seed {
        let billing = BillingService::new(store, Arc::new(SystemClock));
        let tariff = billing
            .create_tariff(&CreateTariffRequest {
                scope: TariffScope::Global,
                charge_box_id: None,
                applies_mode: None,
                valid_from: None,
                valid_to: None,
                price_ac_kwh: seed.price_ac_kwh,
                price_dc_kwh: seed.price_dc_kwh,
                connection_fee: None,
                idle_fee_per_minute: None,
                idle_grace_minutes: None,
            })
            .map_err(|error| format!("cannot seed tariff: {error}"))?;
        println!(
            "seeded global tariff {} (AC {} / DC {} per kWh)",
            tariff.id, tariff.price_ac_kwh, tariff.price_dc_kwh
        );
    }

    Ok(())
}

fn print_usage() {
    println!("usage: create_db [--path <file>] [--force] [--seed-tariff <ac>,<dc>]");
    println!("  --path         sqlite file to create or migrate (default {DEFAULT_PATH})");
    println!("  --force        delete the file first");
    println!("  --seed-tariff  insert a global tariff with these kWh prices");
    println!("point TEST_DB_TEMPLATE_PATH at an unseeded file to reuse it as the test template");
}
