//! Command line of the software TPM emulator

use crate::config::{Config, InstancePaths};

/// Emulator invocation for one instance
///
/// The emulator stays in the foreground so the launcher can reap it. Its TPM is started by the
/// emulator itself, which lets the health check talk to the server socket right away.
pub fn command(config: &Config, paths: &InstancePaths, encrypted: bool) -> std::process::Command {
    let mut command = std::process::Command::new(&config.swtpm_path);

    command
        .args(["socket", "--tpm2"])
        .arg("--tpmstate")
        .arg(option("dir=", &paths.state, ""))
        .arg("--ctrl")
        .arg(option("type=unixio,path=", &paths.control_socket, ",terminate"))
        .arg("--server")
        .arg(option("type=unixio,path=", &paths.server_socket, ""))
        .arg("--log")
        .arg(option(
            "file=",
            &paths.log,
            &format!(",level={}", config.log_level),
        ))
        .arg("--pid")
        .arg(option("file=", &paths.pid_file, ""))
        .args(["--flags", "not-need-init,startup-clear"]);

    if encrypted {
        command.arg("--key").arg(option(
            "file=",
            &config.key_file,
            ",format=binary,mode=aes-256-cbc,remove=true",
        ));
    }

    command.stdin(std::process::Stdio::null());

    command
}

fn option(prefix: &str, path: &std::path::Path, suffix: &str) -> std::ffi::OsString {
    let mut option = std::ffi::OsString::from(prefix);
    option.push(path);
    option.push(suffix);

    option
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arguments(command: &std::process::Command) -> Vec<String> {
        command
            .get_args()
            .map(|argument| argument.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn unencrypted_command_line() {
        let config = Config::default();
        let command = command(&config, &config.paths("vm1"), false);

        assert_eq!(command.get_program(), "/usr/bin/swtpm");
        assert_eq!(
            arguments(&command),
            [
                "socket",
                "--tpm2",
                "--tpmstate",
                "dir=/persist/swtpm/tpm-state-vm1",
                "--ctrl",
                "type=unixio,path=/run/swtpm/vm1.sock,terminate",
                "--server",
                "type=unixio,path=/run/swtpm/vm1.srv.sock",
                "--log",
                "file=/run/swtpm/vm1.log,level=20",
                "--pid",
                "file=/run/swtpm/vm1.pid",
                "--flags",
                "not-need-init,startup-clear",
            ]
        );
    }

    #[test]
    fn encrypted_command_line() {
        let config = Config {
            log_level: 5,
            ..Config::default()
        };
        let arguments = arguments(&command(&config, &config.paths("vm1"), true));

        assert!(arguments.contains(&"file=/run/swtpm/vm1.log,level=5".to_string()));
        assert_eq!(
            &arguments[arguments.len() - 2..],
            [
                "--key",
                "file=/run/swtpm/binkey,format=binary,mode=aes-256-cbc,remove=true"
            ]
        );
    }
}
