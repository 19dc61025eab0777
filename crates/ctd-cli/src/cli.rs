//! Command-line definition

use clap::{Arg, ArgAction, Command};

/// Default checklist location, relative to the working directory
pub(crate) const DEFAULT_RULES_PATH: &str = "rules/checklist.yaml";

fn section_arg() -> Arg {
    Arg::new("section")
        .long("section")
        .short('s')
        .required(true)
        .help("Target section (M1, M2.3, M2.4, M2.5, M2.6, M2.7)")
}

fn format_arg() -> Arg {
    Arg::new("format")
        .long("format")
        .short('f')
        .help("Output format: yaml, json or markdown")
}

fn csv_arg(name: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .action(ArgAction::Append)
        .value_name("FILE_NAME")
        .help("Attached file name; tabular sources switch the conditional policy")
}

fn no_autofix_arg() -> Arg {
    Arg::new("no-autofix")
        .long("no-autofix")
        .action(ArgAction::SetTrue)
        .help("Report issues without normalising the text")
}

pub(crate) fn build_cli() -> Command {
    Command::new("ctdmate")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Route, lint, check and draft CTD submission sections")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("rules")
                .long("rules")
                .global(true)
                .help("Checklist YAML (default: $CTD_CHECKLIST_PATH or rules/checklist.yaml)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("Pipeline configuration TOML"),
        )
        .arg(
            Arg::new("corpus")
                .long("corpus")
                .global(true)
                .help("Guideline corpus (JSONL, YAML or JSON) for reference retrieval"),
        )
        .arg(
            Arg::new("trace-dir")
                .long("trace-dir")
                .global(true)
                .help("Write one JSON trace per pipeline run into this directory"),
        )
        .arg(
            Arg::new("log-json")
                .long("log-json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON on stderr"),
        )
        .subcommand(
            Command::new("route")
                .about("Show the routing plan for a request")
                .arg(Arg::new("text").required(true).help("Request text")),
        )
        .subcommand(
            Command::new("lint")
                .about("Lint a structured draft against the checklist")
                .arg(section_arg())
                .arg(csv_arg("csv"))
                .arg(Arg::new("file").required(true).help("Draft file (YAML or JSON)")),
        )
        .subcommand(
            Command::new("check")
                .about("Validate free text against regulatory references")
                .arg(section_arg())
                .arg(no_autofix_arg())
                .arg(Arg::new("file").required(true).help("Text file")),
        )
        .subcommand(
            Command::new("generate")
                .about("Draft a section")
                .arg(section_arg())
                .arg(
                    Arg::new("prompt")
                        .long("prompt")
                        .short('p')
                        .required(true)
                        .help("Drafting request"),
                )
                .arg(format_arg().default_value("yaml"))
                .arg(csv_arg("csv")),
        )
        .subcommand(
            Command::new("run")
                .about("Run the full pipeline for a request")
                .arg(Arg::new("text").required(true).help("Request text"))
                .arg(
                    Arg::new("content")
                        .long("content")
                        .help("File with submitted structured content"),
                )
                .arg(csv_arg("attach"))
                .arg(
                    Arg::new("section")
                        .long("section")
                        .short('s')
                        .help("Section override"),
                )
                .arg(format_arg())
                .arg(no_autofix_arg()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn parses_run_with_overrides() {
        let matches = build_cli()
            .try_get_matches_from([
                "ctdmate",
                "--rules",
                "custom.yaml",
                "run",
                "M2.6 draft",
                "--attach",
                "m26_01_tox.csv",
                "--attach",
                "notes.pdf",
                "--format",
                "json",
                "--no-autofix",
            ])
            .unwrap();

        assert_eq!(matches.get_one::<String>("rules").map(String::as_str), Some("custom.yaml"));
        let (name, run) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        let attachments: Vec<&String> = run.get_many::<String>("attach").unwrap().collect();
        assert_eq!(attachments.len(), 2);
        assert_eq!(run.get_one::<String>("format").map(String::as_str), Some("json"));
        assert!(run.get_flag("no-autofix"));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let matches = build_cli()
            .try_get_matches_from(["ctdmate", "route", "check this", "--log-json"])
            .unwrap();
        assert!(matches.get_flag("log-json"));
    }

    #[test]
    fn lint_requires_section() {
        assert!(build_cli().try_get_matches_from(["ctdmate", "lint", "draft.yaml"]).is_err());
    }

    #[test]
    fn generate_defaults_to_yaml() {
        let matches = build_cli()
            .try_get_matches_from(["ctdmate", "generate", "-s", "M2.3", "-p", "write the QOS"])
            .unwrap();
        let (_, generate) = matches.subcommand().unwrap();
        assert_eq!(generate.get_one::<String>("format").map(String::as_str), Some("yaml"));
    }
}
