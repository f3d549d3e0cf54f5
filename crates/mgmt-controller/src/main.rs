use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use mgmt_controller::{
    builtin_registry, ControllerConfig, JsonFilePersister, ModelController, Submission,
};
use mgmt_model::{ModelValue, Operation, Request, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Command::new("mgmt-controller")
        .version(mgmt_controller::VERSION)
        .about("Run management operations against an in-memory controller")
        .subcommand_required(true)
        .subcommand(
            Command::new("run")
                .about("Execute operations from a JSON file")
                .arg(
                    Arg::new("ops")
                        .long("ops")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("Operation or list of operations (JSON)"),
                )
                .arg(
                    Arg::new("model")
                        .long("model")
                        .value_parser(value_parser!(PathBuf))
                        .help("Initial resource tree (JSON)"),
                )
                .arg(
                    Arg::new("config")
                        .long("config")
                        .value_parser(value_parser!(PathBuf))
                        .help("Controller configuration (TOML)"),
                )
                .arg(
                    Arg::new("persist")
                        .long("persist")
                        .value_parser(value_parser!(PathBuf))
                        .help("Write the committed tree to this file after each commit"),
                )
                .arg(
                    Arg::new("composite")
                        .long("composite")
                        .action(ArgAction::SetTrue)
                        .help("Run a list of operations as one atomic batch"),
                ),
        )
        .subcommand(
            Command::new("check-config")
                .about("Parse a configuration file and print the effective settings")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        );

    match cli.get_matches().subcommand() {
        Some(("run", args)) => {
            let all_succeeded = run(args).await?;
            if !all_succeeded {
                std::process::exit(1);
            }
        }
        Some(("check-config", args)) => {
            let path = args
                .get_one::<PathBuf>("path")
                .context("missing configuration path")?;
            let config = ControllerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?;
            print!("{}", config.to_toml_string()?);
        }
        _ => {}
    }
    Ok(())
}

async fn run(args: &ArgMatches) -> Result<bool> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => ControllerConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    let mut controller = ModelController::new(builtin_registry()).with_config(config);
    if let Some(path) = args.get_one::<PathBuf>("model") {
        let root = JsonFilePersister::new(path)
            .load()
            .with_context(|| format!("reading model {}", path.display()))?
            .with_context(|| format!("model file {} not found", path.display()))?;
        controller = controller.with_root(root);
    }
    if let Some(path) = args.get_one::<PathBuf>("persist") {
        controller = controller.with_persister(Arc::new(JsonFilePersister::new(path)));
    }

    let path = args
        .get_one::<PathBuf>("ops")
        .context("missing operations file")?;
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading operations {}", path.display()))?;
    let json: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing operations {}", path.display()))?;
    let submissions = submissions(&ModelValue::from_json(json), args.get_flag("composite"))?;

    let mut all_succeeded = true;
    for submission in submissions {
        let response = controller.submit(submission).await;
        all_succeeded &= response.is_success();
        println!("{}", serde_json::to_string_pretty(&response.to_model().to_json())?);
    }
    Ok(all_succeeded)
}

/// A list runs one operation at a time unless `composite` is set
fn submissions(model: &ModelValue, composite: bool) -> Result<Vec<Submission>> {
    match model.value() {
        Value::List(items) => {
            let operations = items
                .iter()
                .map(Operation::from_model)
                .collect::<Result<Vec<_>, _>>()?;
            if composite {
                Ok(vec![Submission::composite(operations)])
            } else {
                Ok(operations.into_iter().map(Submission::single).collect())
            }
        }
        Value::Object(_) => Ok(vec![Submission::from_request(Request::from_model(model)?)]),
        _ => bail!("expected an operation object or a list of operations"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(json: serde_json::Value, composite: bool) -> Result<Vec<Submission>> {
        submissions(&ModelValue::from_json(json), composite)
    }

    #[test]
    fn list_runs_one_submission_per_operation() {
        let ops = json!([
            {"operation": "read-resource"},
            {"operation": "write-attribute", "address": "/subsystem=web", "name": "port", "value": 1}
        ]);

        let sequential = parse(ops.clone(), false).unwrap();
        let batched = parse(ops, true).unwrap();

        assert_eq!(sequential.len(), 2);
        assert!(!sequential[1].request().is_composite());
        assert_eq!(batched.len(), 1);
        assert_eq!(batched[0].request().operations().len(), 2);
    }

    #[test]
    fn object_may_be_a_composite_request() {
        let parsed = parse(
            json!({
                "operation": "composite",
                "steps": [
                    {"operation": "add", "address": [{"deployment": "a.war"}]},
                    {"operation": "deploy", "address": [{"deployment": "a.war"}]}
                ]
            }),
            false,
        )
        .unwrap();

        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].request().is_composite());
    }

    #[test]
    fn scalars_are_rejected() {
        assert!(parse(json!(42), false).is_err());
        assert!(parse(json!([{"address": "/"}]), false).is_err());
    }
}
