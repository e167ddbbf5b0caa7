// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("otad")
        .version(env!("CARGO_PKG_VERSION"))
        .about("OTA update agent for OSTree-based embedded Linux devices")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .action(ArgAction::Append)
                .help("Configuration sources (files or conf.d directories), lowest precedence first"),
        )
        .subcommand(
            Command::new("check")
                .about("Check in with the update server and list targets for this device"),
        )
        .subcommand(
            Command::new("install")
                .about("Download and stage an update")
                .arg(
                    Arg::new("version")
                        .long("version")
                        .value_name("N")
                        .help("Install the target with this version number"),
                )
                .arg(
                    Arg::new("target")
                        .long("target")
                        .value_name("NAME")
                        .help("Install the target with this exact name"),
                )
                .arg(
                    Arg::new("install-mode")
                        .long("install-mode")
                        .value_name("MODE")
                        .default_value("all")
                        .help("What the install covers: all, or delay-app-install"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Allow installing a target older than the current one"),
                ),
        )
        .subcommand(
            Command::new("complete").about("Finalize a pending installation after reboot"),
        )
}

fn render_man(cmd: Command, path: PathBuf) {
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("man page rendering failed");
    fs::write(path, buffer).expect("man page write failed");
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let Some(out_dir) = env::var_os("OUT_DIR").map(PathBuf::from) else {
        return;
    };
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("failed to create man directory");

    let cmd = build_cli();
    for sub in cmd.get_subcommands() {
        render_man(
            sub.clone(),
            man_dir.join(format!("otad-{}.1", sub.get_name())),
        );
    }
    render_man(cmd, man_dir.join("otad.1"));
}
