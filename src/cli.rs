use clap::Parser;

use crate::output::OutputMode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Task file to use
    #[arg(short = 'f', long = "file", default_value = "graphload.toml")]
    pub file: String,

    /// Set a property, e.g. -P gGraphName=OrgGraph (overrides the task file and environment)
    #[arg(short = 'P', long = "property", value_name = "KEY=VALUE", value_parser = parse_property)]
    pub properties: Vec<(String, String)>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// List available tasks by group and exit
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// Number of tasks to run at once; independent tasks run in parallel when above 1
    #[arg(short = 'j', long = "workers")]
    pub workers: Option<usize>,

    /// Show what would be executed without running tasks
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Keep running tasks that do not depend on a failed one
    #[arg(long = "continue-on-failure")]
    pub continue_on_failure: bool,

    /// How to display GSQL client output in the terminal
    #[arg(long = "output", value_enum)]
    pub output: Option<OutputMode>,

    /// Tasks to run, in order; runs the default task if none are given
    pub tasks: Vec<String>,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::parse_from([
            "graphload",
            "-P",
            "gGraphName=OrgGraph",
            "--property",
            "gSecret=a=b",
            "-j",
            "4",
            "createSchema",
            "allLoad",
        ]);

        assert_eq!(cli.file, "graphload.toml");
        assert_eq!(
            cli.properties,
            vec![
                ("gGraphName".to_string(), "OrgGraph".to_string()),
                ("gSecret".to_string(), "a=b".to_string()),
            ]
        );
        assert_eq!(cli.workers, Some(4));
        assert_eq!(cli.tasks, vec!["createSchema", "allLoad"]);
    }

    #[test]
    fn test_parse_property_rejects_missing_key() {
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=value").is_err());
        assert_eq!(
            parse_property("gHost=").unwrap(),
            ("gHost".to_string(), String::new())
        );
    }
}
