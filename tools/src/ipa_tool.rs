// Jackson Coxson
// Create and extract .ipa app packages

use std::path::Path;

use appinstalld::archive;
use clap::{Arg, Command};

fn main() {
    env_logger::init();

    let matches = Command::new("ipa_tool")
        .about("Create and extract .ipa app packages")
        .subcommand_required(true)
        .subcommand(
            Command::new("create")
                .about("Package an .app bundle into an .ipa next to it")
                .arg(
                    Arg::new("bundle")
                        .value_name("APP_BUNDLE")
                        .help("Path to the .app bundle")
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("extract")
                .about("Extract an .ipa archive")
                .arg(
                    Arg::new("archive")
                        .value_name("IPA")
                        .help("Path to the .ipa archive")
                        .required(true),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .short('o')
                        .value_name("DIR")
                        .help("Output directory (default: current directory)")
                        .default_value("."),
                ),
        )
        .subcommand(
            Command::new("locate")
                .about("Print the .app bundle inside an extracted package")
                .arg(
                    Arg::new("dir")
                        .value_name("DIR")
                        .help("Extracted package root")
                        .required(true),
                ),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("create", sub)) => {
            let bundle = sub.get_one::<String>("bundle").unwrap();
            match archive::create_app_archive(Path::new(bundle)) {
                Ok(path) => println!("Created {}", path.display()),
                Err(e) => eprintln!("Failed to create archive: {e}"),
            }
        }
        Some(("extract", sub)) => {
            let archive_path = sub.get_one::<String>("archive").unwrap();
            let output = sub.get_one::<String>("output").unwrap();
            match archive::extract(Path::new(archive_path), Path::new(output)) {
                Ok(()) => println!("Extracted to {output}"),
                Err(e) => eprintln!("Failed to extract archive: {e}"),
            }
        }
        Some(("locate", sub)) => {
            let dir = sub.get_one::<String>("dir").unwrap();
            match archive::locate_app_bundle(Path::new(dir)) {
                Ok(path) => println!("{}", path.display()),
                Err(e) => eprintln!("{e}"),
            }
        }
        _ => unreachable!(),
    }
}
