use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use binsight_policy::{
    award, load_policy_strict, AverageHash, DecisionEngine, Label, Material, Meta, PolicyConfig,
    RuleTable, DEFAULT_POLICY,
};
use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "binsight", version, about = "binsight policy CLI")]
struct Cli {
    /// More log output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Policy file (YAML); the built-in policy when omitted
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Decide offline with the heuristic path
    Decide {
        /// Label as NAME=PROB, highest probability first; repeatable
        #[arg(long = "label", short = 'l', value_parser = parse_label, required = true)]
        labels: Vec<Label>,
        #[arg(long)]
        conf: Option<f64>,
        #[arg(long)]
        delta: Option<f64>,
        #[arg(long)]
        recent: Option<u32>,
    },
    /// Show the resolved rule for every material
    Rules,
    /// Convert years and risk into points
    Points {
        #[arg(long)]
        years: f64,
        #[arg(long, default_value_t = 0.0)]
        risk: f64,
    },
    /// Average-hash helpers
    Hash {
        #[command(subcommand)]
        cmd: HashCmd,
    },
}

#[derive(Subcommand, Debug)]
enum HashCmd {
    /// Hamming distance between two hex hashes
    Distance { a: String, b: String },
}

fn parse_label(raw: &str) -> Result<Label, String> {
    let (name, prob) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected NAME=PROB, got '{raw}'"))?;
    let prob: f64 = prob
        .trim()
        .parse()
        .map_err(|_| format!("invalid probability in '{raw}'"))?;
    if name.trim().is_empty() {
        return Err(format!("empty label name in '{raw}'"));
    }
    Ok(Label::new(name.trim(), prob))
}

fn load(path: Option<&PathBuf>) -> anyhow::Result<PolicyConfig> {
    match path {
        Some(path) => load_policy_strict(path)
            .with_context(|| format!("loading policy {}", path.display())),
        None => Ok(DEFAULT_POLICY.clone()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let policy = load(cli.policy.as_ref())?;

    match cli.command {
        Commands::Decide {
            labels,
            conf,
            delta,
            recent,
        } => {
            let meta = Meta {
                confidence: conf,
                motion_delta: delta,
                recent_submission_count: recent,
            };
            let engine = DecisionEngine::new(Arc::new(policy));
            let outcome = engine.decide(&labels, &RuleTable::new(), &meta).await;
            let points = award(
                outcome.decision.years,
                outcome.decision.risk_score,
                &engine.policy().points,
            );
            tracing::debug!(path = ?outcome.path, "decided");
            let out = json!({
                "decision": outcome.decision,
                "points": points,
                "path": outcome.path,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Rules => print_rules_table(&policy),
        Commands::Points { years, risk } => {
            println!("{}", award(years, risk, &policy.points));
        }
        Commands::Hash { cmd } => match cmd {
            HashCmd::Distance { a, b } => {
                let a: AverageHash = a.parse()?;
                let b: AverageHash = b.parse()?;
                println!("{}", a.distance(b));
            }
        },
    }

    Ok(())
}

fn print_rules_table(policy: &PolicyConfig) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct Row {
        material: &'static str,
        bin: &'static str,
        years: String,
        #[tabled(rename = "Floor")]
        floor: String,
        #[tabled(rename = "Cap")]
        cap: String,
        tip: String,
    }

    let rows: Vec<Row> = Material::TAXONOMY
        .iter()
        .map(|m| {
            let rule = policy.rules.resolve(*m);
            Row {
                material: m.as_str(),
                bin: rule.bin.as_str(),
                years: rule.years.to_string(),
                floor: policy.floor_for(*m).to_string(),
                cap: policy
                    .cap_for(*m)
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
                tip: rule.tip,
            }
        })
        .collect();

    let table = Table::new(rows).to_string();
    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_as_name_and_probability() {
        let label = parse_label("plastic bottle=0.82").unwrap();
        assert_eq!(label.name, "plastic bottle");
        assert_eq!(label.probability, 0.82);

        assert!(parse_label("bottle").is_err());
        assert!(parse_label("bottle=high").is_err());
        assert!(parse_label(" =0.5").is_err());
    }

    #[test]
    fn decide_accepts_repeated_labels() {
        let cli = Cli::try_parse_from([
            "binsight", "decide", "-l", "book=0.7", "--label", "elephant=0.6", "--recent", "4",
        ])
        .unwrap();
        match cli.command {
            Commands::Decide { labels, recent, .. } => {
                assert_eq!(labels.len(), 2);
                assert_eq!(labels[1].name, "elephant");
                assert_eq!(recent, Some(4));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn decide_requires_a_label() {
        assert!(Cli::try_parse_from(["binsight", "decide"]).is_err());
    }

    #[test]
    fn hash_distance_parses() {
        let cli = Cli::try_parse_from(["binsight", "hash", "distance", "ff", "0f"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Hash {
                cmd: HashCmd::Distance { .. }
            }
        ));
    }

    #[test]
    fn builtin_policy_without_path() {
        let policy = load(None).unwrap();
        assert_eq!(policy.capture.hourly_cap, 6);
        assert!(load(Some(&PathBuf::from("/does/not/exist.yaml"))).is_err());
    }
}
