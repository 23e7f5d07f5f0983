use std::{
    fs,
    path::Path,
    str::FromStr,
};

use zeroize::Zeroizing;

use crate::{
    cipher::{load_private_keys, AgeCipher, CipherEngine},
    config::{
        discover_fragment, merge_in, ConfigError, ConfigFragment, Configuration, ExposureArg,
    },
    error::{CredibleError, Result, EXIT_SUCCESS},
    exposure::{ExposureRuntime, MountState, RamfsDriver},
    plan::{plan, PlanRequest, SystemHost},
    resolver::{ResolveError, SecretResolver, SecretTable},
    settings::{BrokerSettings, EnvContract},
    supervisor::ProcessSupervisor,
};

use super::{output, Cli, Command};

pub(crate) fn run(cli: Cli) -> Result<i32> {
    let settings = BrokerSettings::resolve(cli.overrides(), EnvContract::from_env());
    let cwd = std::env::current_dir()?;

    match cli.command {
        Command::RunCommand { command } => {
            let config = load_configuration(&settings, &cwd)?;
            run_command(&settings, &config, &command)
        }
        Command::Mount => {
            let config = load_configuration(&settings, &cwd)?;
            mount(&settings, &config)
        }
        Command::Unmount => unmount(&settings),
        Command::Upload { secret, file } => {
            let config = load_configuration(&settings, &cwd)?;
            upload(&config, &secret, &file)
        }
    }
}

/// Loads every fragment in order and merges ad-hoc exposures last.
fn load_configuration(settings: &BrokerSettings, cwd: &Path) -> Result<Configuration> {
    let fragment_paths = if settings.config_files.is_empty() {
        let discovered = discover_fragment(cwd).ok_or(ConfigError::NoFragments)?;
        tracing::debug!(path = %discovered.display(), "discovered config fragment");
        vec![discovered]
    } else {
        settings.config_files.clone()
    };

    let mut fragments = fragment_paths
        .iter()
        .map(ConfigFragment::load)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let exposures = settings
        .exposures
        .iter()
        .map(|raw| ExposureArg::from_str(raw).map(|arg| arg.0))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if !exposures.is_empty() {
        fragments.push(ConfigFragment::from_exposures(exposures));
    }

    let config = merge_in(cwd, fragments)?;
    tracing::info!(
        storage = %config.storage().describe(),
        secrets = config.secrets().len(),
        exposures = config.exposures().len(),
        "merged configuration"
    );
    Ok(config)
}

fn resolve_secrets(settings: &BrokerSettings, config: &Configuration) -> Result<SecretTable> {
    let keys = load_private_keys(&settings.private_key_paths).map_err(ResolveError::LoadingKeys)?;
    let storage = config.storage().open();
    let table = SecretResolver::new(storage.as_ref(), &AgeCipher).resolve(config, &keys)?;
    Ok(table)
}

fn run_command(settings: &BrokerSettings, config: &Configuration, argv: &[String]) -> Result<i32> {
    let secrets = resolve_secrets(settings, config)?;
    let runtime = ExposureRuntime::new(RamfsDriver::new());
    let mount_state = if config.has_mount_exposures() {
        runtime.mount_state(&settings.layout)?
    } else {
        MountState::Unmounted
    };
    let request = PlanRequest::command(settings.layout.clone(), mount_state)
        .with_default_owner(settings.owner_user.clone(), settings.owner_group.clone());
    let plan = plan(config, &secrets, &request, &SystemHost)?;

    let exit_code = ProcessSupervisor::new(&runtime).run(argv, &plan)?;
    Ok(exit_code)
}

fn mount(settings: &BrokerSettings, config: &Configuration) -> Result<i32> {
    let secrets = resolve_secrets(settings, config)?;
    let runtime = ExposureRuntime::new(RamfsDriver::new());
    let mount_state = runtime.mount_state(&settings.layout)?;
    let request = PlanRequest::system(settings.layout.clone(), mount_state)
        .with_default_owner(settings.owner_user.clone(), settings.owner_group.clone());
    let plan = plan(config, &secrets, &request, &SystemHost)?;
    if plan.is_empty() {
        return print_status("nothing to mount");
    }

    // the marker written inside the mount replaces the records from here on
    let mounted = runtime.materialize(&plan)?;
    let entries = mounted.records().len().saturating_sub(1);
    print_status(&format!(
        "mounted {entries} secret(s) at {}",
        settings.layout.mount_point().display()
    ))
}

fn unmount(settings: &BrokerSettings) -> Result<i32> {
    let runtime = ExposureRuntime::new(RamfsDriver::new());
    let message = if runtime.unmount(&settings.layout)? {
        format!("unmounted {}", settings.layout.mount_point().display())
    } else {
        "not mounted".to_owned()
    };
    print_status(&message)
}

fn upload(config: &Configuration, secret: &str, file: &Path) -> Result<i32> {
    let declared = config
        .secret(secret)
        .ok_or_else(|| CredibleError::InvalidInput(format!("secret is not declared: {secret}")))?;
    let plaintext = Zeroizing::new(fs::read(file)?);
    let ciphertext = AgeCipher.encrypt(&plaintext, &declared.encryption_keys)?;
    config.storage().open().put(&declared.path, &ciphertext)?;
    tracing::info!(secret = %declared.name, path = %declared.path, "uploaded secret");
    print_status(&format!("uploaded {}", declared.name))
}

fn print_status(line: &str) -> Result<i32> {
    output::status_line(line)?;
    Ok(EXIT_SUCCESS)
}
