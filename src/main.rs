use std::path::PathBuf;

const HELP: &str = "parkfeed - park photo feed client

Usage: parkfeed [options] [command]

Commands:
  feed [pages]               Print the feed, one or more pages (default)
  comments <post-id>         Print the comments on a post
  comment <post-id> <text>   Comment on a post
  like <post-id>             Like or unlike a post
  profile [user-id]          Print a profile and its posts
  login <email>              Sign in; the password is read from stdin
  logout                     Sign out and forget the stored session

Options:
  --config <path>            Config file (default ~/.config/parkfeed/config.yaml)
  --state <path>             State database (default ~/.config/parkfeed/state.db)
  --version, -V              Show version and exit
  --help,    -h              Show this help message

Without a configured backend the commands run against built-in demo data.";

fn main() {
    let (args, options) = match parse_args(std::env::args().skip(1)) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = parkfeed::run(args, options) {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

/// Splits global flags from the command. `Ok(None)` means a flag was fully
/// handled and the process should exit.
fn parse_args(
    mut raw: impl Iterator<Item = String>,
) -> anyhow::Result<Option<(Vec<String>, parkfeed::app::RunOptions)>> {
    let mut options = parkfeed::app::RunOptions::default();
    let mut args = Vec::new();
    while let Some(arg) = raw.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("parkfeed {}", parkfeed::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{HELP}");
                return Ok(None);
            }
            "--config" => {
                let path = raw
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
                options.config_file = Some(PathBuf::from(path));
            }
            "--state" => {
                let path = raw
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--state needs a path"))?;
                options.state_db = Some(PathBuf::from(path));
            }
            _ => args.push(arg),
        }
    }
    Ok(Some((args, options)))
}
