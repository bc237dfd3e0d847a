//! Composition of the imaging pipeline.
//!
//! A job becomes an ordered list of external stages, each a separate process
//! whose stdout feeds the next one's stdin:
//!
//! 1. read: streams the whole device and reports byte counts on stderr,
//! 2. cipher (optional): AES-256-CBC, key derived with PBKDF2 (100 000 iterations),
//! 3. compress (optional): generic stream compressor,
//!
//! followed by the in-process write stage that persists the stream (see
//! [`crate::process`]). No shell is involved and no secret is ever placed on
//! a command line: the elevation secret goes to the elevation tool's stdin,
//! the passphrase to an environment variable set on the cipher process only.
use crate::config::EngineConfig;
use crate::elevate::ELEVATION_ARGS;
use crate::error::ImagingError;
use crate::job::{ImagingJob, ImagingOptions};
use crate::secret::{Secret, mask_secrets};
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Environment variable the cipher stage reads its passphrase from.
pub const PASSPHRASE_ENV: &str = "DISKSHOT_PASSPHRASE";

/// PBKDF2 iteration count for the cipher stage.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

pub const ENCRYPTED_SUFFIX: &str = ".enc";
pub const COMPRESSED_SUFFIX: &str = ".gz";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageKind {
    Read,
    Cipher,
    Compress,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Read => "read",
            StageKind::Cipher => "cipher",
            StageKind::Compress => "compress",
        }
    }
}

/// How a stage receives its secret.
#[derive(Clone, Debug)]
pub(crate) enum SecretChannel {
    /// Written to the child's stdin, then the pipe is closed.
    Stdin(Secret),
    /// Set as an environment variable on that child only.
    Env(&'static str, Secret),
}

/// One external process of the pipeline.
#[derive(Clone, Debug)]
pub struct StageCommand {
    pub kind: StageKind,
    pub program: String,
    pub args: Vec<OsString>,
    env: Vec<(&'static str, &'static str)>,
    pub(crate) secret: Option<SecretChannel>,
}

impl StageCommand {
    fn new(kind: StageKind, program: &str) -> Self {
        Self {
            kind,
            program: program.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            secret: None,
        }
    }

    fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Whether the stage expects a secret on stdin.
    pub fn reads_secret_from_stdin(&self) -> bool {
        matches!(self.secret, Some(SecretChannel::Stdin(_)))
    }

    /// The command for this stage, secret environment included. Stdio is
    /// left to the caller.
    pub(crate) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(SecretChannel::Env(name, secret)) = &self.secret {
            cmd.env(name, secret.expose());
        }
        cmd
    }

    /// Shell-like rendering. Secrets are masked in each raw token before it
    /// is quoted, since quoting rewrites some characters.
    fn render(&self, secrets: &[&Secret]) -> String {
        std::iter::once(OsStr::new(&self.program))
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(|token| display_masked(token, secrets))
            .collect::<Vec<String>>()
            .join(" ")
    }
}

/// A fully composed pipeline, ready to spawn.
#[derive(Debug)]
pub struct PipelineSpec {
    stages: Vec<StageCommand>,
    output: PathBuf,
    description: String,
}

impl PipelineSpec {
    pub fn stages(&self) -> &[StageCommand] {
        &self.stages
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    /// The image file the write stage creates.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Shell-like rendering of the pipeline with every secret masked.
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Appends `.enc` (if encrypting) then `.gz` (if compressing) to
/// `destination`.
///
/// The suffix order is fixed and does not follow the stage order; tools
/// that restore images rely on it.
pub fn output_path(destination: &Path, options: &ImagingOptions) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    if options.encrypt {
        name.push(ENCRYPTED_SUFFIX);
    }
    if options.compress {
        name.push(COMPRESSED_SUFFIX);
    }
    PathBuf::from(name)
}

pub struct PipelineBuilder<'a> {
    config: &'a EngineConfig,
    elevate: bool,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self {
            config,
            elevate: false,
        }
    }

    /// Run the read stage through the elevation tool.
    pub fn elevate(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    /// Composes the pipeline for `job`.
    ///
    /// Every tool the selected stages need is located first; if one is
    /// missing the build fails and nothing is spawned or created.
    pub fn build(&self, job: &ImagingJob) -> Result<PipelineSpec, ImagingError> {
        let options = &job.options;
        options.validate()?;

        let passphrase = match (&job.credentials.passphrase, options.encrypt) {
            (Some(secret), true) if !secret.is_empty() => Some(secret),
            (_, true) => return Err(ImagingError::MissingPassphrase),
            (_, false) => None,
        };
        let elevation = match (&job.credentials.elevation, self.elevate) {
            (Some(secret), true) => Some(secret),
            _ => None,
        };

        require_tool(&self.config.read_tool, "disk reading")?;
        if elevation.is_some() {
            require_tool(&self.config.elevation_tool, "privilege elevation")?;
        }
        if passphrase.is_some() {
            require_tool(&self.config.cipher_tool, "encryption")?;
        }
        if options.compress {
            require_tool(&self.config.compress_tool, "compression")?;
        }

        let mut stages = vec![self.read_stage(job, elevation)];

        if let Some(passphrase) = passphrase {
            let mut cipher = StageCommand::new(StageKind::Cipher, &self.config.cipher_tool)
                .args(["enc", "-aes-256-cbc", "-salt", "-pbkdf2", "-iter"])
                .arg(PBKDF2_ITERATIONS.to_string())
                .arg("-pass")
                .arg(format!("env:{PASSPHRASE_ENV}"));
            cipher.secret = Some(SecretChannel::Env(PASSPHRASE_ENV, passphrase.clone()));
            stages.push(cipher);
        }

        if options.compress {
            stages.push(StageCommand::new(StageKind::Compress, &self.config.compress_tool).arg("-c"));
        }

        let output = output_path(&job.destination, options);
        let secrets: Vec<&Secret> = job.credentials.secrets().collect();
        let rendered = format!(
            "{} > {}",
            stages
                .iter()
                .map(|stage| stage.render(&secrets))
                .collect::<Vec<_>>()
                .join(" | "),
            display_masked(output.as_os_str(), &secrets)
        );
        // Catches secrets spanning token boundaries.
        let description = mask_secrets(&rendered, secrets.iter().copied());

        Ok(PipelineSpec {
            stages,
            output,
            description,
        })
    }

    fn read_stage(&self, job: &ImagingJob, elevation: Option<&Secret>) -> StageCommand {
        let mut input = OsString::from("if=");
        input.push(&job.source);
        let dd_args = [
            input,
            format!("bs={}", self.config.block_size).into(),
            "status=progress".into(),
        ];

        let mut stage = match elevation {
            Some(secret) => {
                let mut stage = StageCommand::new(StageKind::Read, &self.config.elevation_tool)
                    .args(ELEVATION_ARGS)
                    .arg(&self.config.read_tool)
                    .args(dd_args);
                stage.secret = Some(SecretChannel::Stdin(secret.clone()));
                stage
            }
            None => StageCommand::new(StageKind::Read, &self.config.read_tool).args(dd_args),
        };
        // Progress lines are parsed; keep them in the untranslated format.
        stage.env.push(("LC_ALL", "C"));
        stage
    }
}

fn require_tool(tool: &str, purpose: &'static str) -> Result<PathBuf, ImagingError> {
    find_tool(tool).ok_or_else(|| ImagingError::MissingDependency {
        tool: tool.to_string(),
        purpose,
    })
}

/// Locates an executable by name on `PATH`, or checks an explicit path.
pub fn find_tool(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    env::split_paths(&env::var_os("PATH")?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn display_masked(arg: &OsStr, secrets: &[&Secret]) -> String {
    let masked = mask_secrets(&arg.to_string_lossy(), secrets.iter().copied());
    display_arg(OsStr::new(&masked))
}

fn display_arg(arg: &OsStr) -> String {
    let text = arg.to_string_lossy();
    let plain = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=./:,+@%".contains(c));
    if plain {
        text.into_owned()
    } else {
        format!("'{}'", text.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Credentials;
    use crate::secret::MASK;

    fn config() -> EngineConfig {
        // `sh` stands in for every tool: it exists everywhere the tests run.
        EngineConfig {
            read_tool: "sh".into(),
            cipher_tool: "sh".into(),
            compress_tool: "sh".into(),
            elevation_tool: "sh".into(),
            ..Default::default()
        }
    }

    fn job(compress: bool, encrypt: bool) -> ImagingJob {
        ImagingJob::new("/dev/sdb", "/backups/disk.img")
            .with_options(ImagingOptions {
                compress,
                encrypt,
                ..Default::default()
            })
            .with_credentials(Credentials {
                elevation: Some(Secret::new("root-pw")),
                passphrase: Some(Secret::new("s3cret")),
            })
    }

    #[test]
    fn suffixes_follow_fixed_order() {
        let base = Path::new("/tmp/img");
        let opts = |compress, encrypt| ImagingOptions {
            compress,
            encrypt,
            ..Default::default()
        };
        assert_eq!(output_path(base, &opts(false, false)), Path::new("/tmp/img"));
        assert_eq!(output_path(base, &opts(false, true)), Path::new("/tmp/img.enc"));
        assert_eq!(output_path(base, &opts(true, false)), Path::new("/tmp/img.gz"));
        assert_eq!(output_path(base, &opts(true, true)), Path::new("/tmp/img.enc.gz"));
    }

    #[test]
    fn stage_order_is_read_cipher_compress() {
        let config = config();
        let spec = PipelineBuilder::new(&config).build(&job(true, true)).unwrap();
        assert_eq!(
            spec.stage_kinds(),
            vec![StageKind::Read, StageKind::Cipher, StageKind::Compress]
        );
        assert_eq!(spec.output(), Path::new("/backups/disk.img.enc.gz"));

        let plain = PipelineBuilder::new(&config).build(&job(false, false)).unwrap();
        assert_eq!(plain.stage_kinds(), vec![StageKind::Read]);
        assert_eq!(plain.output(), Path::new("/backups/disk.img"));
    }

    #[test]
    fn cipher_uses_pbkdf2_and_env_channel() {
        let config = config();
        let spec = PipelineBuilder::new(&config).build(&job(false, true)).unwrap();
        let cipher = &spec.stages()[1];
        let args: Vec<_> = cipher.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            ["enc", "-aes-256-cbc", "-salt", "-pbkdf2", "-iter", "100000", "-pass", "env:DISKSHOT_PASSPHRASE"]
        );

        let cmd = cipher.command();
        let env: Vec<_> = cmd.get_envs().collect();
        assert_eq!(env, [(OsStr::new(PASSPHRASE_ENV), Some(OsStr::new("s3cret")))]);
        assert!(cmd.get_args().all(|a| !a.to_string_lossy().contains("s3cret")));
    }

    #[test]
    fn elevated_read_stage_takes_secret_on_stdin() {
        let config = config();
        let spec = PipelineBuilder::new(&config)
            .elevate(true)
            .build(&job(false, false))
            .unwrap();
        let read = &spec.stages()[0];
        assert!(read.reads_secret_from_stdin());
        let cmd = read.command();
        assert!(cmd.get_args().all(|a| !a.to_string_lossy().contains("root-pw")));
        assert!(spec.description().starts_with("sh -S -p '' sh if=/dev/sdb bs=1M status=progress"));
    }

    #[test]
    fn unelevated_read_stage_ignores_elevation_secret() {
        let config = config();
        let spec = PipelineBuilder::new(&config).build(&job(false, false)).unwrap();
        assert!(!spec.stages()[0].reads_secret_from_stdin());
        assert_eq!(spec.description(), "sh if=/dev/sdb bs=1M status=progress > /backups/disk.img");
    }

    #[test]
    fn description_masks_secrets_everywhere() {
        let config = config();
        // Secrets that also appear inside displayed paths.
        let job = ImagingJob::new("/dev/sdb", "/backups/s3cret/s3cret-root-pw.img")
            .with_options(ImagingOptions {
                encrypt: true,
                compress: true,
                ..Default::default()
            })
            .with_credentials(Credentials {
                elevation: Some(Secret::new("root-pw")),
                passphrase: Some(Secret::new("s3cret")),
            });
        let spec = PipelineBuilder::new(&config).elevate(true).build(&job).unwrap();
        let description = spec.description();
        assert!(!description.contains("s3cret"));
        assert!(!description.contains("root-pw"));
        assert!(description.contains(MASK));
        assert!(description.ends_with(".img.enc.gz'"));
    }

    #[test]
    fn secret_with_quote_is_masked_before_quoting() {
        let config = config();
        let job = ImagingJob::new("/dev/sdb", "/backups/it's/disk.img").with_credentials(Credentials {
            elevation: Some(Secret::new("it's")),
            ..Default::default()
        });
        let spec = PipelineBuilder::new(&config).build(&job).unwrap();
        let description = spec.description();
        assert!(!description.contains("it's"));
        assert!(!description.contains(r"it'\''s"));
        assert_eq!(
            description,
            "sh if=/dev/sdb bs=1M status=progress > '/backups/***/disk.img'"
        );
    }

    #[test]
    fn missing_cipher_tool_fails_before_anything_exists() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("disk.img");
        let config = EngineConfig {
            read_tool: "sh".into(),
            cipher_tool: "diskshot-no-such-cipher".into(),
            ..Default::default()
        };
        let job = ImagingJob::new("/dev/sdb", &destination)
            .with_options(ImagingOptions {
                encrypt: true,
                ..Default::default()
            })
            .with_credentials(Credentials {
                passphrase: Some(Secret::new("pw")),
                ..Default::default()
            });

        let err = PipelineBuilder::new(&config).build(&job).unwrap_err();
        assert!(matches!(
            err,
            ImagingError::MissingDependency { ref tool, purpose: "encryption" } if tool == "diskshot-no-such-cipher"
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn encryption_without_passphrase_is_rejected() {
        let config = config();
        let mut job = job(false, true);
        job.credentials.passphrase = None;
        assert!(matches!(
            PipelineBuilder::new(&config).build(&job),
            Err(ImagingError::MissingPassphrase)
        ));
    }

    #[test]
    fn split_request_fails_build() {
        let config = config();
        let mut job = job(false, false);
        job.options.split = true;
        job.options.split_size_mb = Some(4096);
        assert!(matches!(
            PipelineBuilder::new(&config).build(&job),
            Err(ImagingError::UnsupportedOption { .. })
        ));
    }

    #[test]
    fn find_tool_checks_path_and_explicit_paths() {
        assert!(find_tool("sh").is_some());
        assert!(find_tool("/bin/sh").is_some());
        assert!(find_tool("diskshot-definitely-missing").is_none());
        assert!(find_tool("/nonexistent/sh").is_none());
        assert!(find_tool("").is_none());
    }

    #[test]
    fn display_arg_quotes_when_needed() {
        assert_eq!(display_arg(OsStr::new("if=/dev/sda")), "if=/dev/sda");
        assert_eq!(display_arg(OsStr::new("")), "''");
        assert_eq!(display_arg(OsStr::new("my disk.img")), "'my disk.img'");
        assert_eq!(display_arg(OsStr::new("it's")), r"'it'\''s'");
    }
}
