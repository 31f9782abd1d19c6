use std::io::{self, Read, Write};

use log::{debug, error};

use self::{
    error::{CniError, ErrorCode},
    validate::{validate_config, validate_container_id, validate_interface_name},
    version::{check_version, decode_config_version, VersionInfo},
};

pub mod error;
pub mod validate;
pub mod version;

pub const COMMAND_ADD: &str = "ADD";
pub const COMMAND_CHECK: &str = "CHECK";
pub const COMMAND_DEL: &str = "DEL";
pub const COMMAND_VERSION: &str = "VERSION";

struct EnvVariable {
    name: &'static str,
    required_for: &'static [&'static str],
}

const INVOCATION_COMMANDS: &[&str] = &[COMMAND_ADD, COMMAND_CHECK, COMMAND_DEL];

const ENV_VARIABLES: [EnvVariable; 6] = [
    EnvVariable {
        name: "CNI_COMMAND",
        required_for: INVOCATION_COMMANDS,
    },
    EnvVariable {
        name: "CNI_CONTAINERID",
        required_for: INVOCATION_COMMANDS,
    },
    EnvVariable {
        name: "CNI_NETNS",
        required_for: &[COMMAND_ADD, COMMAND_CHECK],
    },
    EnvVariable {
        name: "CNI_IFNAME",
        required_for: INVOCATION_COMMANDS,
    },
    EnvVariable {
        name: "CNI_ARGS",
        required_for: &[],
    },
    EnvVariable {
        name: "CNI_PATH",
        required_for: INVOCATION_COMMANDS,
    },
];

/// Everything a single plugin invocation was given by the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub ifname: String,
    pub args: String,
    pub path: String,
    pub stdin_data: Vec<u8>,
}

/// The plugin's command implementations. Results are written to `out`, any
/// `CniError` found in the returned error is reported as is.
pub trait Handlers {
    fn add(&self, args: &CmdArgs, out: &mut dyn Write) -> anyhow::Result<()>;

    fn del(&self, args: &CmdArgs, out: &mut dyn Write) -> anyhow::Result<()>;
}

pub struct Dispatcher<G, I, O, E> {
    getenv: G,
    stdin: I,
    stdout: O,
    stderr: E,
}

impl<G, I, O, E> Dispatcher<G, I, O, E>
where
    G: Fn(&str) -> Option<String>,
    I: Read,
    O: Write,
    E: Write,
{
    pub fn new(getenv: G, stdin: I, stdout: O, stderr: E) -> Self {
        Self {
            getenv,
            stdin,
            stdout,
            stderr,
        }
    }

    fn env(&self, name: &str) -> String {
        (self.getenv)(name).unwrap_or_default()
    }

    fn read_cmd_args(&mut self) -> Result<(String, CmdArgs), CniError> {
        let command = self.env("CNI_COMMAND");
        let mut values = Vec::with_capacity(ENV_VARIABLES.len());
        let mut missing = Vec::new();

        for variable in ENV_VARIABLES.iter() {
            let value = self.env(variable.name);
            let required = variable.name == "CNI_COMMAND"
                || variable.required_for.contains(&command.as_str());

            if value.is_empty() && required {
                missing.push(variable.name);
            }
            values.push(value);
        }

        if !missing.is_empty() {
            return Err(CniError::new(
                ErrorCode::InvalidEnvironment,
                format!("required env variables [{}] missing", missing.join(",")),
            ));
        }

        let mut stdin_data = Vec::new();
        if command != COMMAND_VERSION {
            self.stdin.read_to_end(&mut stdin_data).map_err(|err| {
                CniError::new(
                    ErrorCode::IoFailure,
                    format!("error reading from stdin: {err}"),
                )
            })?;
        }

        let [_, container_id, netns, ifname, args, path]: [String; 6] = values
            .try_into()
            .map_err(|_| CniError::new(ErrorCode::Internal, "environment table mismatch"))?;

        Ok((
            command,
            CmdArgs {
                container_id,
                netns,
                ifname,
                args,
                path,
                stdin_data,
            },
        ))
    }

    fn check_version_and_call<F>(&mut self, cmd_args: &CmdArgs, handler: F) -> Result<(), CniError>
    where
        F: FnOnce(&CmdArgs, &mut dyn Write) -> anyhow::Result<()>,
    {
        let version = decode_config_version(&cmd_args.stdin_data)?;
        check_version(&version)?;

        handler(cmd_args, &mut self.stdout).map_err(|err| match err.downcast::<CniError>() {
            Ok(cni_error) => cni_error,
            Err(err) => CniError::internal(err),
        })
    }

    /// Runs one invocation. `about` is printed when the plugin is run by hand
    /// without a command.
    pub fn run(&mut self, handlers: &impl Handlers, about: &str) -> Result<(), CniError> {
        let (command, cmd_args) = match self.read_cmd_args() {
            Ok(parsed) => parsed,
            Err(err) => {
                if err.code == ErrorCode::InvalidEnvironment
                    && self.env("CNI_COMMAND").is_empty()
                    && !about.is_empty()
                {
                    let _ = writeln!(self.stderr, "{about}");
                    return Ok(());
                }

                return Err(err);
            }
        };

        debug!(
            "{command} for container '{}' (netns '{}', interface '{}')",
            cmd_args.container_id, cmd_args.netns, cmd_args.ifname
        );

        if command != COMMAND_VERSION {
            validate_config(&cmd_args.stdin_data)?;
            validate_container_id(&cmd_args.container_id)?;
            validate_interface_name(&cmd_args.ifname)?;
        }

        match command.as_str() {
            COMMAND_ADD => self.check_version_and_call(&cmd_args, |args, out| handlers.add(args, out)),
            COMMAND_CHECK => Ok(()),
            COMMAND_DEL => self.check_version_and_call(&cmd_args, |args, out| handlers.del(args, out)),
            COMMAND_VERSION => serde_json::to_writer(&mut self.stdout, &VersionInfo::default())
                .map_err(|err| CniError::new(ErrorCode::IoFailure, err.to_string())),
            _ => Err(CniError::new(
                ErrorCode::InvalidEnvironment,
                format!("unknown CNI_COMMAND: {command}"),
            )),
        }
    }
}

/// Dispatches the invocation described by the process environment and
/// returns the exit code.
pub fn plugin_main(handlers: &impl Handlers, about: &str) -> i32 {
    let stdout = io::stdout();
    let mut dispatcher = Dispatcher::new(
        |name: &str| std::env::var(name).ok(),
        io::stdin().lock(),
        stdout.lock(),
        io::stderr().lock(),
    );

    match dispatcher.run(handlers, about) {
        Ok(()) => 0,
        Err(err) => {
            error!("Invocation failed! {} ({:?}) {}", err.msg, err.code, err.details);
            if let Err(print_err) = err.print(&mut dispatcher.stdout) {
                error!("Couldn't write the error document! {print_err:?}");
            }
            1
        }
    }
}
