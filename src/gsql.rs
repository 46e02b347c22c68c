use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use regex::Regex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{
    error::{GraphloadError, Result},
    output::OutputMode,
    settings::{Settings, UriScheme},
    task::{GsqlScript, GsqlSource},
    util::{CommandError, output_print_lock, run_command_with_timeout},
};

const DEFAULT_CLIENT: &str = "gsql";

static SCRIPT_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%([A-Za-z_][A-Za-z0-9_]*)%").expect("script token pattern"));

/// Runs GSQL scripts through the external GSQL client.
pub struct GsqlRunner {
    settings: Arc<Settings>,
    output_mode: OutputMode,
}

impl GsqlRunner {
    pub fn new(settings: Arc<Settings>, output_mode: OutputMode) -> Self {
        Self {
            settings,
            output_mode,
        }
    }

    /// Client program and its leading arguments.
    pub fn client(&self) -> (String, Vec<String>) {
        let command = match (&self.settings.gsql_client, &self.settings.client_version) {
            (Some(client), _) => client.clone(),
            (None, Some(version)) => format!("java -jar gsql_client-{}.jar", version),
            (None, None) => DEFAULT_CLIENT.to_string(),
        };

        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| DEFAULT_CLIENT.to_string());
        (program, parts.collect())
    }

    /// Arguments passed after the client command; `target` is the rendered
    /// script path or the inline statement.
    pub fn arguments(&self, script: &GsqlScript, target: &str) -> Vec<String> {
        let settings = &self.settings;
        let (user, password) = if script.use_global {
            (&settings.admin_user_name, &settings.admin_password)
        } else {
            (&settings.user_name, &settings.password)
        };

        let mut args = vec![
            "-ip".to_string(),
            settings.host.clone(),
            "-u".to_string(),
            user.clone(),
            "-p".to_string(),
            password.clone(),
        ];

        if settings.scheme == UriScheme::Https {
            if let Some(cert) = &settings.cert_path {
                args.push("-cacert".to_string());
                args.push(cert.to_string_lossy().to_string());
            }
        }

        if !script.use_global {
            args.push("-g".to_string());
            args.push(settings.graph_name.clone());
        }

        args.push(target.to_string());
        args
    }

    pub async fn run(&self, task: &str, script: &GsqlScript) -> Result<()> {
        let target = match &script.source {
            GsqlSource::File(path) => self
                .render_script(task, path)
                .await?
                .to_string_lossy()
                .to_string(),
            GsqlSource::Command(command) => command.clone(),
        };

        let (program, mut args) = self.client();
        args.extend(self.arguments(script, &target));
        debug!("Task '{}': {} {}", task, program, mask_password(&args).join(" "));

        let stream_output = matches!(self.output_mode, OutputMode::Stream);
        let timeout = self.settings.command_timeout;
        let output = match run_command_with_timeout(&program, &args, timeout, stream_output).await {
            Ok(output) => output,
            Err(CommandError::Timeout) => return Err(GraphloadError::Timeout(task.to_string())),
            Err(CommandError::Io(e)) => {
                return Err(GraphloadError::Gsql {
                    task: task.to_string(),
                    status: format!("failed to start '{}': {}", program, e),
                });
            }
        };

        if let Err(e) = self.append_log(task, &output.stdout, &output.stderr).await {
            warn!("Could not write log for task '{}': {}", task, e);
        }

        if !stream_output {
            let _lock = output_print_lock().lock().await;
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stdout.trim().is_empty() {
                println!("{}", stdout.trim_end());
            }
            if !stderr.trim().is_empty() {
                eprintln!("{}", stderr.trim_end());
            }
        }

        if !output.status.success() {
            return Err(GraphloadError::Gsql {
                task: task.to_string(),
                status: output.status.to_string(),
            });
        }

        info!("Task '{}': gsql finished", task);
        Ok(())
    }

    /// Copies the script into the log directory with `%token%` placeholders
    /// replaced, returning the copy's path.
    async fn render_script(&self, task: &str, script: &Path) -> Result<PathBuf> {
        let source = self.settings.script_dir.join(script);
        let contents = tokio::fs::read_to_string(&source).await.map_err(|e| {
            GraphloadError::Config(format!(
                "Task '{}': could not read script '{}': {}",
                task,
                source.display(),
                e
            ))
        })?;

        let rendered = replace_tokens(&contents, &self.settings.gsql_tokens);

        let dir = self.settings.log_dir.join("scripts");
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(format!("{}.gsql", task));
        tokio::fs::write(&target, rendered).await?;
        Ok(target)
    }

    async fn append_log(&self, task: &str, stdout: &[u8], stderr: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.settings.log_dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.settings.log_dir.join(format!("{}.log", task)))
            .await?;
        file.write_all(stdout).await?;
        file.write_all(stderr).await?;
        file.flush().await
    }
}

pub fn replace_tokens(script: &str, tokens: &BTreeMap<String, String>) -> String {
    SCRIPT_TOKEN
        .replace_all(script, |caps: &regex::Captures| {
            tokens
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string()
}

fn mask_password(args: &[String]) -> Vec<String> {
    let mut masked = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            masked.push("****".to_string());
            hide_next = false;
            continue;
        }
        hide_next = arg == "-p";
        masked.push(arg.clone());
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::sample_settings;

    fn runner(settings: Settings) -> GsqlRunner {
        GsqlRunner::new(Arc::new(settings), OutputMode::Group)
    }

    fn script(source: GsqlSource, use_global: bool) -> GsqlScript {
        GsqlScript { source, use_global }
    }

    #[test]
    fn test_arguments_for_graph_scope() {
        let gsql = runner(sample_settings());
        let args = gsql.arguments(&script(GsqlSource::Command("ls".into()), false), "ls");
        assert_eq!(
            args,
            vec![
                "-ip",
                "graph.local",
                "-u",
                "tigergraph",
                "-p",
                "secret-pw",
                "-g",
                "OrgGraph",
                "ls"
            ]
        );
    }

    #[test]
    fn test_arguments_for_global_scope_with_cert() {
        let mut settings = sample_settings();
        settings.scheme = UriScheme::Https;
        settings.cert_path = Some(PathBuf::from("certs/ca.pem"));

        let gsql = runner(settings);
        let args = gsql.arguments(
            &script(GsqlSource::File("schema.gsql".into()), true),
            "logs/scripts/createSchema.gsql",
        );
        assert_eq!(
            args,
            vec![
                "-ip",
                "graph.local",
                "-u",
                "admin",
                "-p",
                "admin-pw",
                "-cacert",
                "certs/ca.pem",
                "logs/scripts/createSchema.gsql"
            ]
        );
    }

    #[test]
    fn test_client_selection() {
        let mut settings = sample_settings();
        assert_eq!(runner(settings.clone()).client(), ("gsql".to_string(), vec![]));

        settings.client_version = Some("2.6.0".to_string());
        assert_eq!(
            runner(settings.clone()).client(),
            (
                "java".to_string(),
                vec!["-jar".to_string(), "gsql_client-2.6.0.jar".to_string()]
            )
        );

        settings.gsql_client = Some("/opt/tigergraph/bin/gsql".to_string());
        assert_eq!(
            runner(settings).client(),
            ("/opt/tigergraph/bin/gsql".to_string(), vec![])
        );
    }

    #[test]
    fn test_replace_tokens() {
        let tokens = BTreeMap::from([("graphname".to_string(), "OrgGraph".to_string())]);
        assert_eq!(
            replace_tokens("USE GRAPH %graphname%\nDROP JOB %unknown%\n100%", &tokens),
            "USE GRAPH OrgGraph\nDROP JOB %unknown%\n100%"
        );
    }

    #[test]
    fn test_mask_password() {
        let args: Vec<String> = ["-u", "admin", "-p", "hunter2", "ls"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(mask_password(&args), vec!["-u", "admin", "-p", "****", "ls"]);
    }

    #[tokio::test]
    async fn test_render_script_writes_copy() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("db_scripts");
        std::fs::create_dir_all(scripts.join("schema")).unwrap();
        std::fs::write(
            scripts.join("schema/schema.gsql"),
            "CREATE GRAPH %graphname%()\n",
        )
        .unwrap();

        let mut settings = sample_settings();
        settings.script_dir = scripts;
        settings.log_dir = dir.path().join("logs");
        settings.gsql_tokens = BTreeMap::from([("graphname".to_string(), "OrgGraph".to_string())]);

        let gsql = runner(settings);
        let rendered = gsql
            .render_script("createSchema", Path::new("schema/schema.gsql"))
            .await
            .unwrap();

        assert_eq!(rendered, dir.path().join("logs/scripts/createSchema.gsql"));
        assert_eq!(
            std::fs::read_to_string(rendered).unwrap(),
            "CREATE GRAPH OrgGraph()\n"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_failure_status() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sample_settings();
        settings.gsql_client = Some("false".to_string());
        settings.log_dir = dir.path().join("logs");

        let gsql = runner(settings);
        let err = gsql
            .run("showSchema", &script(GsqlSource::Command("ls".into()), false))
            .await
            .unwrap_err();

        assert!(matches!(err, GraphloadError::Gsql { ref task, .. } if task == "showSchema"));
        assert!(dir.path().join("logs/showSchema.log").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_succeeds_and_logs_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = sample_settings();
        settings.gsql_client = Some("echo".to_string());
        settings.log_dir = dir.path().join("logs");

        let gsql = runner(settings);
        gsql.run("showSchema", &script(GsqlSource::Command("ls".into()), false))
            .await
            .unwrap();

        let log = std::fs::read_to_string(dir.path().join("logs/showSchema.log")).unwrap();
        assert!(log.contains("-g OrgGraph ls"));
    }
}
