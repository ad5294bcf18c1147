#[cfg(all(test, unix))]
mod cli_integration_tests {
    use std::path::Path;
    use assert_cmd::Command;
    use predicates::prelude::*;
    use tempfile::{tempdir, TempDir};
    use formulary::digest;

    /// Writes a payload and a formula manifest pointing at it via `file://`.
    fn add_formula(dir: &TempDir, name: &str, version: &str, deps: &[&str], test: &str) {
        let payload = dir.path().join("payloads").join(format!("{name}-{version}"));
        std::fs::create_dir_all(payload.parent().unwrap()).unwrap();
        let body = format!("#!/bin/sh\necho {name} {version}\n");
        std::fs::write(&payload, &body).unwrap();
        let deps: Vec<String> = deps.iter().map(|d| format!("\"{d}\"")).collect();
        let manifest = format!(
            r#"name = "{name}"
version = "{version}"
url = "file://{url}"
sha256 = "{sha}"
depends_on = [{deps}]
caveats = "Thanks for installing {name}."

[[install]]
from = "{name}-{version}"
to = "bin/{name}"

[test]
command = {test}
"#,
            url = payload.display(),
            sha = digest::compute(body.as_bytes()),
            deps = deps.join(", "),
        );
        let formulas = dir.path().join("formulas");
        std::fs::create_dir_all(&formulas).unwrap();
        std::fs::write(formulas.join(format!("{name}-{version}.toml")), manifest).unwrap();
    }

    fn formulary(dir: &Path) -> Command {
        let mut cmd = Command::cargo_bin("formulary").unwrap();
        cmd.env("FORMULARY_CONFIG", dir.join("config.toml"))
            .env("FORMULARY_PREFIX", dir.join("prefix"))
            .env("FORMULARY_FORMULAS", dir.join("formulas"))
            .env("FORMULARY_CACHE", dir.join("cache"))
            .env("NO_COLOR", "1")
            .env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn test_version_flag() {
        let dir = tempdir().unwrap();
        formulary(dir.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_install_with_dependency() {
        let dir = tempdir().unwrap();
        add_formula(&dir, "fzf", "1.0.0", &[], r#"["{bin}/fzf"]"#);
        add_formula(&dir, "fzf-wrapper", "2.1.0", &["fzf"], r#"["fzf-wrapper"]"#);

        formulary(dir.path())
            .args(["install", "fzf-wrapper"])
            .assert()
            .success()
            .stdout(predicate::str::contains("install fzf@1.0.0"))
            .stdout(predicate::str::contains("install fzf-wrapper@2.1.0"))
            .stdout(predicate::str::contains("Thanks for installing fzf-wrapper."));

        let installed = std::fs::read_to_string(dir.path().join("prefix/bin/fzf-wrapper")).unwrap();
        assert_eq!(installed, "#!/bin/sh\necho fzf-wrapper 2.1.0\n");

        formulary(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("fzf@1.0.0"))
            .stdout(predicate::str::contains("fzf-wrapper@2.1.0"));
    }

    #[test]
    fn test_install_into_relative_prefix() {
        let dir = tempdir().unwrap();
        add_formula(&dir, "tool", "1.0.0", &[], r#"["{bin}/tool"]"#);
        formulary(dir.path())
            .current_dir(dir.path())
            .env_remove("FORMULARY_PREFIX")
            .args(["--prefix", "relative", "install", "tool"])
            .assert()
            .success();

        let link = dir.path().join("relative/bin/tool");
        assert!(std::fs::read_link(&link).unwrap().is_absolute());
        assert_eq!(std::fs::read_to_string(&link).unwrap(), "#!/bin/sh\necho tool 1.0.0\n");
    }

    #[test]
    fn test_install_unknown_formula_exits_1() {
        let dir = tempdir().unwrap();
        formulary(dir.path())
            .args(["install", "nope"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("nope"));
    }

    #[test]
    fn test_failed_test_exits_2_and_keeps_files() {
        let dir = tempdir().unwrap();
        add_formula(&dir, "broken", "1.0.0", &[], r#"["sh", "-c", "exit 4"]"#);
        formulary(dir.path())
            .args(["install", "broken"])
            .assert()
            .code(2);
        assert!(dir.path().join("prefix/bin/broken").exists());
    }

    #[test]
    fn test_upgrade_and_rollback() {
        let dir = tempdir().unwrap();
        add_formula(&dir, "tool", "1.0.0", &[], r#"["tool"]"#);
        formulary(dir.path()).args(["install", "tool"]).assert().success();

        formulary(dir.path())
            .args(["upgrade", "tool"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already up to date"));

        formulary(dir.path())
            .args(["rollback", "tool"])
            .assert()
            .code(3);

        add_formula(&dir, "tool", "2.0.0", &[], r#"["tool"]"#);
        formulary(dir.path())
            .args(["upgrade", "tool"])
            .assert()
            .success()
            .stdout(predicate::str::contains("upgrade tool@2.0.0"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("prefix/bin/tool")).unwrap(),
            "#!/bin/sh\necho tool 2.0.0\n"
        );

        formulary(dir.path())
            .args(["rollback", "tool"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Rolled back tool@1.0.0"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("prefix/bin/tool")).unwrap(),
            "#!/bin/sh\necho tool 1.0.0\n"
        );
    }

    #[test]
    fn test_plan_json() {
        let dir = tempdir().unwrap();
        add_formula(&dir, "fzf", "1.0.0", &[], r#"["fzf"]"#);
        add_formula(&dir, "fzf-wrapper", "2.1.0", &["fzf"], r#"["fzf-wrapper"]"#);
        let output = formulary(dir.path())
            .args(["plan", "fzf-wrapper", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let plan: serde_json::Value = serde_json::from_slice(&output).unwrap();
        let steps = plan["steps"].as_array().unwrap();
        assert_eq!(steps[0]["formula"]["name"], "fzf");
        assert_eq!(steps[1]["formula"]["name"], "fzf-wrapper");
        assert_eq!(steps[1]["action"], "install");
        assert!(!dir.path().join("prefix/bin/fzf").exists());
    }

    #[test]
    fn test_fetch_and_clean_cache() {
        let dir = tempdir().unwrap();
        add_formula(&dir, "tool", "1.0.0", &[], r#"["tool"]"#);
        formulary(dir.path())
            .args(["fetch", "tool"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Fetched tool"));
        assert_eq!(std::fs::read_dir(dir.path().join("cache")).unwrap().count(), 1);

        formulary(dir.path()).args(["cache", "clean"]).assert().success();
        assert!(!dir.path().join("cache").exists() || std::fs::read_dir(dir.path().join("cache")).unwrap().count() == 0);
    }

    #[test]
    fn test_uninstall_required_dependency_is_refused() {
        let dir = tempdir().unwrap();
        add_formula(&dir, "fzf", "1.0.0", &[], r#"["fzf"]"#);
        add_formula(&dir, "fzf-wrapper", "2.1.0", &["fzf"], r#"["fzf-wrapper"]"#);
        formulary(dir.path()).args(["install", "fzf-wrapper"]).assert().success();

        formulary(dir.path())
            .args(["uninstall", "fzf"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("fzf-wrapper"));

        formulary(dir.path())
            .args(["uninstall", "fzf", "--force"])
            .assert()
            .success();
        assert!(!dir.path().join("prefix/bin/fzf").exists());
    }
}
