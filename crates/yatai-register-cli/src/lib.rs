//! Command surface for the yatai register.
//!
//! The register subcommands drive one checkout flow each; the analytics
//! subcommands recompute their views from the full ledger on every call.
//! Rendering beyond plain tables and JSON belongs to the caller.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use uuid::Uuid;
use yatai_register_core::{
    bundle_utilization, checkout, co_purchase_counts, decode_table, format_sheet_timestamp,
    item_ranking, mine_rules, summary, time_trend, AnalyticsConfig, BasketMiningOutcome, Catalog,
    CartLine, CheckoutReceipt, ItemRanking, LedgerRow, LedgerSchema, RegisterError, SalesSummary,
    Session, TrendBucket,
};
use yatai_register_store_sqlite::SqliteLedgerStore;

#[derive(Debug, Parser)]
#[command(name = "yatai")]
#[command(about = "Food-stall register and sales analytics CLI")]
pub struct Cli {
    /// Sqlite ledger path.
    #[arg(long, default_value = "./yatai_register.sqlite3")]
    db: PathBuf,

    /// Catalog JSON file; the built-in festival menu when omitted.
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Analytics config JSON file; built-in defaults when omitted.
    #[arg(long)]
    analytics_config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Register {
        #[command(subcommand)]
        command: Box<RegisterCommand>,
    },
    /// Prints the catalog.
    Menu,
    Analytics {
        #[command(subcommand)]
        command: Box<AnalyticsCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum RegisterCommand {
    /// Totals an order without recording it.
    Preview(OrderArgs),
    /// Records an order in the ledger and prints the receipt.
    Checkout(OrderArgs),
}

#[derive(Debug, Args)]
pub struct OrderArgs {
    /// SKU name; repeat the flag for multiple units.
    #[arg(long = "item")]
    items: Vec<String>,

    /// Ad-hoc bundle as `<item>+<item>=<price>`; defines it for this order
    /// and adds one unit.
    #[arg(long = "custom-bundle")]
    custom_bundles: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum AnalyticsCommand {
    Summary(JsonOutputArgs),
    Ranking(JsonOutputArgs),
    Trend(TrendArgs),
    Rules(RulesArgs),
    CoPurchase(CoPurchaseArgs),
    Bundles(JsonOutputArgs),
}

#[derive(Debug, Args)]
pub struct JsonOutputArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct TrendArgs {
    /// Bucket width in minutes; must divide one hour.
    #[arg(long)]
    bucket_minutes: Option<i64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct RulesArgs {
    #[arg(long)]
    min_support: Option<f64>,
    #[arg(long)]
    min_lift: Option<f64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct CoPurchaseArgs {
    /// The item whose companions to rank.
    #[arg(long)]
    item: String,
    #[arg(long)]
    json: bool,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store access, or the
/// requested command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let catalog = load_catalog(cli.catalog.as_deref())?;
    let config = load_analytics_config(cli.analytics_config.as_deref())?;
    let schema = LedgerSchema::current();

    match cli.command {
        Command::Register { command } => match *command {
            RegisterCommand::Preview(args) => run_preview(&catalog, &args),
            RegisterCommand::Checkout(args) => {
                let mut store = open_store(&cli.db, &schema)?;
                run_checkout(&mut store, &catalog, &schema, &args)
            }
        },
        Command::Menu => {
            println!("{}", serde_json::to_string_pretty(catalog.skus())?);
            Ok(())
        }
        Command::Analytics { command } => {
            let store = open_store(&cli.db, &schema)?;
            let table = store.read_table().context("failed to read the ledger")?;
            let rows = decode_table(&table, &schema);
            run_analytics(*command, &rows, &catalog, &config)
        }
    }
}

fn open_store(path: &Path, schema: &LedgerSchema) -> Result<SqliteLedgerStore> {
    let store = SqliteLedgerStore::open(path)
        .with_context(|| format!("ledger store unavailable at {}", path.display()))?;
    store
        .migrate(schema)
        .context("ledger store migration failed")?;
    Ok(store)
}

fn load_catalog(path: Option<&Path>) -> Result<Catalog> {
    let Some(path) = path else {
        return Ok(Catalog::standard());
    };
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("catalog {} is not valid JSON", path.display()))?;
    Ok(Catalog::from_json(&value)?)
}

fn load_analytics_config(path: Option<&Path>) -> Result<AnalyticsConfig> {
    let Some(path) = path else {
        return Ok(AnalyticsConfig::v1());
    };
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read analytics config {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("analytics config {} is not valid JSON", path.display()))?;
    Ok(AnalyticsConfig::from_json(&value)?)
}

fn build_session(catalog: &Catalog, args: &OrderArgs) -> Result<Session> {
    let mut session = Session::new();
    for item in &args.items {
        session
            .add(catalog, item)
            .map_err(|err| anyhow!("cannot add {item}: {err}"))?;
    }
    for spec in &args.custom_bundles {
        let (components, price) = parse_custom_bundle_spec(spec)?;
        let name = session
            .define_custom_bundle(catalog, &components, price)
            .map_err(|err| anyhow!("cannot define custom bundle {spec}: {err}"))?;
        session
            .add(catalog, &name)
            .map_err(|err| anyhow!("cannot add {name}: {err}"))?;
    }
    if session.is_empty() {
        bail!("the order is empty: pass at least one --item or --custom-bundle");
    }
    Ok(session)
}

fn parse_custom_bundle_spec(spec: &str) -> Result<(Vec<String>, i64)> {
    let Some((components_raw, price_raw)) = spec.rsplit_once('=') else {
        bail!("custom bundle must be <item>+<item>=<price>, got {spec}");
    };
    let price: i64 = price_raw
        .trim()
        .parse()
        .with_context(|| format!("invalid custom bundle price in {spec}"))?;
    let components: Vec<String> = components_raw
        .split('+')
        .map(|component| component.trim().to_string())
        .filter(|component| !component.is_empty())
        .collect();
    Ok((components, price))
}

fn run_preview(catalog: &Catalog, args: &OrderArgs) -> Result<()> {
    let session = build_session(catalog, args)?;
    let lines = session.grouped(catalog)?;
    let total = session.total(catalog)?;
    let payload = json!({
        "lines": lines,
        "total_amount": total,
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_checkout(
    store: &mut SqliteLedgerStore,
    catalog: &Catalog,
    schema: &LedgerSchema,
    args: &OrderArgs,
) -> Result<()> {
    let mut session = build_session(catalog, args)?;
    let receipt = checkout(&mut session, catalog, schema, store).map_err(|err| match err {
        RegisterError::StoreAppend(_) | RegisterError::StoreUnavailable(_) => {
            anyhow!("{err}; the order was not recorded, retry the same checkout")
        }
        other => anyhow!("checkout rejected: {other}"),
    })?;

    tracing::info!(
        transaction_id = %receipt.transaction_id,
        total_amount = receipt.total_amount,
        "recorded checkout"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&build_receipt_json_payload(&receipt)?)?
    );
    Ok(())
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ReceiptJsonPayload {
    timestamp: String,
    transaction_id: Uuid,
    total_amount: i64,
    lines: Vec<CartLine>,
}

fn build_receipt_json_payload(receipt: &CheckoutReceipt) -> Result<ReceiptJsonPayload> {
    Ok(ReceiptJsonPayload {
        timestamp: format_sheet_timestamp(receipt.timestamp).map_err(|err| anyhow!("{err}"))?,
        transaction_id: receipt.transaction_id,
        total_amount: receipt.total_amount,
        lines: receipt.lines.clone(),
    })
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct TrendBucketJsonPayload {
    start: String,
    count: usize,
    revenue: i64,
}

fn build_trend_json_payload(buckets: &[TrendBucket]) -> Result<Vec<TrendBucketJsonPayload>> {
    buckets
        .iter()
        .map(|bucket| {
            Ok(TrendBucketJsonPayload {
                start: format_sheet_timestamp(bucket.start).map_err(|err| anyhow!("{err}"))?,
                count: bucket.count,
                revenue: bucket.revenue,
            })
        })
        .collect()
}

fn run_analytics(
    command: AnalyticsCommand,
    rows: &[LedgerRow],
    catalog: &Catalog,
    config: &AnalyticsConfig,
) -> Result<()> {
    match command {
        AnalyticsCommand::Summary(args) => {
            let result = summary(rows, catalog);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            Ok(())
        }
        AnalyticsCommand::Ranking(args) => {
            let ranking = item_ranking(rows, catalog, config)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&ranking)?);
            } else {
                print_ranking(&ranking);
            }
            Ok(())
        }
        AnalyticsCommand::Trend(args) => {
            let width = args.bucket_minutes.unwrap_or(config.bucket_width_minutes);
            let buckets = time_trend(rows, width)?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&build_trend_json_payload(&buckets)?)?
                );
            } else {
                print_trend(&buckets)?;
            }
            Ok(())
        }
        AnalyticsCommand::Rules(args) => {
            let mut config = config.clone();
            if let Some(min_support) = args.min_support {
                config.min_support = min_support;
            }
            if let Some(min_lift) = args.min_lift {
                config.min_lift = min_lift;
            }
            config.validate()?;

            let outcome = mine_rules(rows, catalog, &config)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
                return Ok(());
            }
            match outcome {
                BasketMiningOutcome::Rules(rules) => {
                    println!(
                        "{:<40} {:>9} {:>11} {:>7}",
                        "rule", "support", "confidence", "lift"
                    );
                    println!("{}", "-".repeat(72));
                    for rule in rules {
                        let label =
                            format!("{} => {}", rule.antecedent.join("+"), rule.consequent.join("+"));
                        println!(
                            "{label:<40} {:>9.3} {:>11.3} {:>7.3}",
                            rule.support, rule.confidence, rule.lift
                        );
                    }
                }
                BasketMiningOutcome::InsufficientData { have, required } => {
                    println!(
                        "insufficient data: {have} transactions recorded, need {} more",
                        required.saturating_sub(have)
                    );
                }
            }
            Ok(())
        }
        AnalyticsCommand::CoPurchase(args) => {
            let counts = co_purchase_counts(rows, catalog, config, &args.item)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&counts)?);
            } else {
                println!("bought together with {}:", args.item);
                for entry in counts {
                    println!("{:<40} {:>6}", entry.name, entry.count);
                }
            }
            Ok(())
        }
        AnalyticsCommand::Bundles(args) => {
            let utilization = bundle_utilization(rows, catalog);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&utilization)?);
            } else {
                println!("{:<48} {:>6}", "bundle family", "sold");
                println!("{}", "-".repeat(56));
                for family in &utilization.families {
                    println!("{:<48} {:>6}", family.name, family.count);
                }
                println!();
                println!("total bundles:  {}", utilization.total_bundles);
                println!("discounted:     {}", utilization.discounted);
                println!(
                    "discount rate:  {:.1} %",
                    utilization.discount_rate * 100.0
                );
            }
            Ok(())
        }
    }
}

fn print_summary(summary: &SalesSummary) {
    println!("total_sales:       ¥{}", summary.total_sales);
    println!("total_cost:        ¥{}", summary.total_cost);
    println!("gross_profit:      ¥{}", summary.gross_profit);
    println!("transaction_count: {}", summary.transaction_count);
    println!("avg_ticket:        ¥{:.0}", summary.avg_ticket);
}

fn print_ranking(ranking: &ItemRanking) {
    println!("{:<40} {:>6} {:>10}", "item (by revenue)", "qty", "revenue");
    println!("{}", "-".repeat(58));
    for item in &ranking.by_revenue {
        println!("{:<40} {:>6} {:>10}", item.name, item.quantity, item.revenue);
    }
    println!();
    println!("{:<40} {:>6} {:>10}", "item (by quantity)", "qty", "revenue");
    println!("{}", "-".repeat(58));
    for item in &ranking.by_quantity {
        println!("{:<40} {:>6} {:>10}", item.name, item.quantity, item.revenue);
    }
}

fn print_trend(buckets: &[TrendBucket]) -> Result<()> {
    println!("{:<20} {:>6} {:>10}", "bucket start", "count", "revenue");
    println!("{}", "-".repeat(38));
    for bucket in buckets {
        let start = format_sheet_timestamp(bucket.start).map_err(|err| anyhow!("{err}"))?;
        println!("{:<20} {:>6} {:>10}", start, bucket.count, bucket.revenue);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_bundle_spec_parses_components_and_price() {
        let (components, price) = match parse_custom_bundle_spec("フランクフルト+缶ジュース=400") {
            Ok(parsed) => parsed,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        };
        assert_eq!(
            components,
            vec!["フランクフルト".to_string(), "缶ジュース".to_string()]
        );
        assert_eq!(price, 400);
    }

    #[test]
    fn custom_bundle_spec_without_price_is_rejected() {
        assert!(parse_custom_bundle_spec("フランクフルト+缶ジュース").is_err());
        assert!(parse_custom_bundle_spec("ラムネ=twohundred").is_err());
    }

    #[test]
    fn empty_orders_are_rejected_before_touching_the_store() {
        let catalog = Catalog::standard();
        let args = OrderArgs {
            items: Vec::new(),
            custom_bundles: Vec::new(),
        };
        assert!(build_session(&catalog, &args).is_err());
    }

    #[test]
    fn unknown_items_surface_the_sku_name() {
        let catalog = Catalog::standard();
        let args = OrderArgs {
            items: vec!["たこ焼き".to_string()],
            custom_bundles: Vec::new(),
        };
        let err = match build_session(&catalog, &args) {
            Ok(_) => panic!("expected the order to be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("たこ焼き"));
    }
}
