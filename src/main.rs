use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use infraheal::config::Config;
use infraheal::orchestrator::{CancelToken, CreationResult};
use infraheal::service::{self, CreateComponentRequest, InfraService, DEFAULT_WORKDIR};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn workdir_arg() -> Arg {
    Arg::new("workdir")
        .long("workdir")
        .short('w')
        .help("Project working directory")
        .value_name("DIR")
        .default_value(DEFAULT_WORKDIR)
        .value_parser(value_parser!(PathBuf))
}

fn component_arg() -> Arg {
    Arg::new("name")
        .help("Component name; all components when omitted")
        .num_args(1)
}

fn cli() -> Command {
    Command::new("infraheal")
        .about("Self-healing infrastructure provisioning")
        .long_about("infraheal generates terraform components from natural language, applies them, and repairs them when plan or apply fails")
        .arg(Arg::new("verbose")
            .long("verbose")
            .short('v')
            .help("Show debug logs")
            .global(true)
            .action(ArgAction::SetTrue))
        .arg(Arg::new("json")
            .long("json")
            .help("Print results as JSON")
            .global(true)
            .action(ArgAction::SetTrue))
        .subcommand_required(true)
        .subcommand(Command::new("init")
            .about("Initialize a project")
            .arg(workdir_arg())
            .arg(Arg::new("local")
                .long("local")
                .help("Target LocalStack instead of AWS")
                .action(ArgAction::SetTrue)))
        .subcommand(Command::new("create")
            .about("Create a component from a prompt")
            .arg(Arg::new("prompt")
                .help("What to build")
                .required(true)
                .num_args(1..))
            .arg(Arg::new("name")
                .long("name")
                .short('n')
                .help("Component name")
                .default_value("main"))
            .arg(Arg::new("model")
                .long("model")
                .short('m')
                .help("Model used for generation"))
            .arg(Arg::new("self-healing")
                .long("self-healing")
                .help("Repair the code when plan or apply fails")
                .action(ArgAction::SetTrue))
            .arg(Arg::new("max-attempts")
                .long("max-attempts")
                .help("Maximum number of attempts with self-healing")
                .default_value("3")
                .value_parser(value_parser!(u32)))
            .arg(Arg::new("keep-on-failure")
                .long("keep-on-failure")
                .help("Keep generated files when creation fails")
                .action(ArgAction::SetTrue))
            .arg(workdir_arg()))
        .subcommand(Command::new("list")
            .about("List components of a project")
            .arg(workdir_arg()))
        .subcommand(Command::new("destroy")
            .about("Destroy live resources, keeping component files")
            .arg(component_arg())
            .arg(workdir_arg()))
        .subcommand(Command::new("delete")
            .about("Destroy live resources and remove component files")
            .arg(component_arg())
            .arg(workdir_arg()))
        .subcommand(Command::new("projects")
            .about("List projects in a directory and its children")
            .arg(Arg::new("parent")
                .help("Directory to scan")
                .default_value(".")
                .value_parser(value_parser!(PathBuf))))
        .subcommand(Command::new("config")
            .about("Show or change configuration")
            .arg(Arg::new("set-api-key")
                .long("set-api-key")
                .help("Set the OpenAI API key")
                .value_name("API_KEY")
                .num_args(1)))
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn workdir(matches: &ArgMatches) -> PathBuf {
    matches
        .get_one::<PathBuf>("workdir")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(success: bool) -> ExitCode {
    if success { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

fn print_creation(result: &CreationResult) {
    if result.success {
        println!("✅ Component '{}' created", result.component_name);
        if let Some(summary) = &result.plan_summary {
            println!("📋 {}", summary);
        }
        if result.self_healing_attempts > 0 {
            println!("🩹 Fixed {} error(s) along the way", result.self_healing_attempts);
        }
        for (name, output) in &result.outputs {
            let value = if output.sensitive {
                "<sensitive>".to_string()
            } else {
                output.value.to_string()
            };
            println!("  {} = {}", name, value);
        }
    } else {
        eprintln!("❌ {}", result.error_message.as_deref().unwrap_or("Component creation failed"));
        for fixed in &result.fixed_errors {
            eprintln!("  attempt {}: {}", fixed.attempt, fixed.error.lines().next().unwrap_or_default());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let matches = cli().get_matches();
    let json = matches.get_flag("json");
    init_tracing(matches.get_flag("verbose"));

    let config = Config::load()?;

    match matches.subcommand() {
        Some(("config", sub)) => {
            if let Some(api_key) = sub.get_one::<String>("set-api-key") {
                let mut config = config;
                config.set_api_key(api_key.clone())?;
                println!("✅ API key saved successfully");
            } else {
                Config::show_config_info()?;
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(("projects", sub)) => {
            let parent = sub
                .get_one::<PathBuf>("parent")
                .cloned()
                .unwrap_or_else(|| PathBuf::from("."));
            let response = service::list_projects(&parent);
            if json {
                print_json(&response)?;
            } else {
                println!("{}", response.message);
                for project in &response.projects {
                    println!("  {}", project.display());
                }
            }
            Ok(exit_code(response.success))
        }
        Some((name, sub)) => {
            let cancel = CancelToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, stopping after the current step");
                    on_interrupt.cancel();
                }
            });

            let service = InfraService::from_config(&config)?.with_cancel_token(cancel);
            run_project_command(&service, &config, name, sub, json, matches.get_flag("verbose")).await
        }
        None => Ok(ExitCode::FAILURE),
    }
}

async fn run_project_command(
    service: &InfraService,
    config: &Config,
    name: &str,
    sub: &ArgMatches,
    json: bool,
    verbose: bool,
) -> anyhow::Result<ExitCode> {
    let workdir = workdir(sub);
    match name {
        "init" => {
            let response = service
                .initialize_project(&workdir, verbose, sub.get_flag("local"))
                .await;
            if json {
                print_json(&response)?;
            } else if response.success {
                println!("✅ {} ({})", response.message, response.workdir.display());
            } else {
                eprintln!("❌ {}", response.message);
            }
            Ok(exit_code(response.success))
        }
        "create" => {
            if !config.is_mock_mode() && config.get_api_key().is_none() {
                eprintln!("❌ No API key configured. Run `infraheal config --set-api-key <key>` or set OPENAI_API_KEY.");
                return Ok(ExitCode::FAILURE);
            }

            let prompt: Vec<String> = sub
                .get_many::<String>("prompt")
                .unwrap_or_default()
                .cloned()
                .collect();
            let mut request = CreateComponentRequest::new(prompt.join(" "));
            request.name = sub
                .get_one::<String>("name")
                .cloned()
                .unwrap_or_else(|| "main".to_string());
            request.model = sub.get_one::<String>("model").cloned();
            request.self_healing = sub.get_flag("self-healing");
            request.max_attempts = sub.get_one::<u32>("max-attempts").copied().unwrap_or(3);
            request.keep_on_failure = sub.get_flag("keep-on-failure");
            request.workdir = workdir;

            info!("Creating component '{}'", request.name);
            let result = service.create_component(&request).await;
            if json {
                print_json(&result)?;
            } else {
                print_creation(&result);
            }
            Ok(exit_code(result.success))
        }
        "list" | "destroy" | "delete" => {
            let response = match name {
                "list" => service.list_components(&workdir),
                "destroy" => {
                    let component = sub.get_one::<String>("name").map(String::as_str);
                    service.destroy_components(&workdir, component).await
                }
                _ => {
                    let component = sub.get_one::<String>("name").map(String::as_str);
                    service.delete_components(&workdir, component).await
                }
            };
            if json {
                print_json(&response)?;
            } else if response.success {
                println!("{}", response.message);
                for component in &response.components {
                    println!("  {}", component);
                }
            } else {
                eprintln!("❌ {}", response.message);
            }
            Ok(exit_code(response.success))
        }
        other => {
            eprintln!("Unknown command '{}'. Use 'infraheal --help' for usage information.", other);
            Ok(ExitCode::FAILURE)
        }
    }
}
