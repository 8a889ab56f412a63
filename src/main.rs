use std::{
    error::Error,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::anyhow;
use clap::Parser;
use delay::{DelayModel, DelayParameters};
use llm::{echo::EchoBackend, gemini::{GeminiClient, GeminiOptions}};
use sys::{llm::Backends, prompt::PromptBook};

mod chat;
mod component;
mod delay;
mod llm;
mod sys;

#[derive(Debug, clap::Parser)]
struct Args {
    /// project file (toml)
    #[arg(long, short)]
    project_path: Option<String>,

    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// talk to a local echo instead of the hosted models
    #[arg(long)]
    offline: bool,

    /// the terminal belongs to the UI, so logs go here
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct Project {
    #[serde(default)]
    gemini: GeminiOptions,
    #[serde(default)]
    delay: DelayParameters,
}

fn load_project(project_path: Option<&str>) -> anyhow::Result<Project> {
    let mut project: Project = match project_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|_| anyhow!("project file `{}` not found", path))?;
            toml::from_str(&text)?
        }
        None => Project::default(),
    };
    project.gemini.fill_default_value();
    project.delay = project.delay.sanitize();
    Ok(project)
}

fn init_logger(log_file: Option<&Path>) -> anyhow::Result<()> {
    let default_filter = if log_file.is_some() { "info" } else { "error" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow!("log file `{}`: {e}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

fn backends(args: &Args, project: &Project) -> anyhow::Result<Backends> {
    if args.offline {
        let echo = Arc::new(EchoBackend);
        return Ok(Backends {
            profiles: echo.clone(),
            chats: echo.clone(),
            portraits: echo,
            chat_model: "echo".to_string(),
        });
    }

    let api_key = args
        .api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| {
            anyhow!("no API key: pass --api-key or set GEMINI_API_KEY (or run with --offline)")
        })?;
    let client = Arc::new(GeminiClient::new(api_key, project.gemini.clone())?);
    Ok(Backends {
        chat_model: client.options().chat_model.clone(),
        profiles: client.clone(),
        chats: client.clone(),
        portraits: client,
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Args::parse();
    init_logger(cli.log_file.as_deref())?;

    let project = load_project(cli.project_path.as_deref())?;
    log::info!("project: {:?}", project);

    let backends = backends(&cli, &project)?;
    let (tx, rx) = chat::im_channel::channel();
    let runner = chat::worker::ThreadRunner::new(chat::worker::Worker::new(&backends, tx));
    let session = chat::Session::new(&backends, PromptBook::new()?, DelayModel::new(project.delay));

    let app = component::App::new(session, rx, Box::new(runner));
    let res = app.run_loop();

    if let Err(err) = res {
        println!("{err:?}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn project_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[gemini]
text_model = "gemini-2.0-flash"

[delay]
thinking_cap_ms = 2500.0
comma_pause_ms = [400.0, 450.0]
"#
        )
        .unwrap();

        let project = load_project(file.path().to_str()).unwrap();
        assert_eq!(project.gemini.text_model, "gemini-2.0-flash");
        assert_eq!(project.gemini.chat_model, "gemini-2.0-flash");
        assert!(!project.gemini.image_model.is_empty());
        assert_eq!(project.delay.thinking_cap_ms, 2500.0);
        assert_eq!(project.delay.comma_pause_ms, [400.0, 450.0]);
        assert_eq!(project.delay.typing_floor_ms, 50.0);
    }

    #[test]
    fn no_project_file_means_defaults() {
        let project = load_project(None).unwrap();
        assert_eq!(project.delay, DelayParameters::default());
        assert!(project.gemini.api_base.starts_with("https://"));
    }

    #[test]
    fn missing_project_file_is_an_error() {
        let err = load_project(Some("/nonexistent/npc-link.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn offline_needs_no_key() {
        let args = Args::try_parse_from(["npc-link", "--offline"]).unwrap();
        let backends = backends(&args, &Project::default()).unwrap();
        assert_eq!(backends.chat_model, "echo");
    }

    #[test]
    fn online_without_key_is_refused() {
        let args = Args {
            project_path: None,
            api_key: Some("  ".to_string()),
            offline: false,
            log_file: None,
        };
        let err = backends(&args, &load_project(None).unwrap()).err().unwrap();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }
}
