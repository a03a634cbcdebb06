use std::process::Command;

fn run(cmd: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(cmd).args(args).output().ok()?;
    String::from_utf8(out.stdout)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn main() {
    let revision = run("git", &["rev-list", "--count", "HEAD"]).unwrap_or_else(|| "0".into());
    let date = run("date", &["+%Y-%m-%d"]).unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=CROSSWIRE_VERSION={}_r{}", date, revision);
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
