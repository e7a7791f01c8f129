use std::path::PathBuf;

pub(crate) struct Args {
    pub config: PathBuf,
    pub record_dir: PathBuf,
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut config = PathBuf::from("rtpbridge.toml");
    let mut record_dir = PathBuf::from("./recordings");

    let raw: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < raw.len() {
        match raw[i].as_str() {
            "-V" | "--version" => {
                println!("rtpbridge-cli {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("rtpbridge-cli - drives the bridge engine over newline-delimited JSON");
                println!();
                println!("USAGE:");
                println!("    rtpbridge-cli [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --config <PATH>       Config TOML [default: rtpbridge.toml]");
                println!("    --record-dir <PATH>   Directory for recording output [default: ./recordings]");
                std::process::exit(0);
            }
            "--config" => {
                i += 1;
                config = PathBuf::from(raw.get(i).ok_or_else(|| anyhow::anyhow!("--config requires a value"))?);
            }
            "--record-dir" => {
                i += 1;
                record_dir =
                    PathBuf::from(raw.get(i).ok_or_else(|| anyhow::anyhow!("--record-dir requires a value"))?);
            }
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
        i += 1;
    }

    Ok(Args { config, record_dir })
}
