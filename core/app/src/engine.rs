//! Engine facade: the command surface used by the desktop bridge and CLI.
//!
//! Long-running commands return a [`JobHandle`]. Locks are taken before the
//! handle is returned, so a second conflicting command fails at once with
//! `ContainerBusy`; argument and lock errors arrive as the job's `Error`
//! event like any other failure.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use tvault_common::{EngineResult, TokenType};
use tvault_container::{
    paths, reseal, scanner, seal, unseal, EngineConfig, KeySource, PathGuard, PathLocks,
    ResealRequest, SealRequest, TokenFormat, TokenSink, UnsealRequest,
};
use tvault_crypto::{EntropyAccumulator, EntropySeed};

use crate::args::{ContainerInfoArgs, DecryptArgs, EncryptArgs, ResealArgs};
use crate::job::{self, InfoResult, JobHandle, JobKind, JobOutput};

/// Shared engine state. Cloning shares the lock table and entropy pool.
#[derive(Debug, Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    locks: PathLocks,
    entropy: Arc<Mutex<EntropyAccumulator>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let entropy = EntropyAccumulator::new(config.entropy_target_bits);
        Self {
            config: Arc::new(config),
            locks: PathLocks::new(),
            entropy: Arc::new(Mutex::new(entropy)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    /// How long callers wait for a job's terminal event.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.config.job_timeout_secs)
    }

    fn entropy(&self) -> MutexGuard<'_, EntropyAccumulator> {
        self.entropy.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check that a container can be created at `path`.
    ///
    /// Creates the parent directory when it is missing.
    ///
    /// # Errors
    /// - `ContainerNewPathRequired` for an empty path
    /// - `ContainerPathExists` if `path` exists and `overwrite` is false
    pub fn check_container_path(&self, path: &str, overwrite: bool) -> EngineResult<()> {
        paths::check_container_path(Path::new(path), overwrite)
    }

    /// Whether `path` is an existing regular file.
    pub fn check_file_exists(&self, path: &str) -> bool {
        paths::check_file_exists(Path::new(path))
    }

    /// Remove a directory; succeeds if it does not exist.
    pub fn remove_dir(&self, path: &str, recursive: bool) -> EngineResult<()> {
        paths::remove_dir(Path::new(path), recursive)
    }

    /// Feed collected bytes to the entropy pool.
    ///
    /// Returns the cumulative estimate, capped at the configured target.
    pub fn entropy_batch(&self, bytes: &[u8]) -> u32 {
        let mut pool = self.entropy();
        let bits = pool.add_batch(bytes);
        debug!(batch = bytes.len(), bits, target = pool.target_bits(), "Entropy batch");
        bits
    }

    /// Whether enough entropy has been collected to seal with it.
    pub fn entropy_ready(&self) -> bool {
        self.entropy().is_ready()
    }

    fn take_seed(&self) -> EngineResult<EntropySeed> {
        self.entropy().take_seed()
    }

    fn prepare_encrypt(&self, args: &EncryptArgs) -> EngineResult<(PathGuard, SealRequest)> {
        let mut req = args.to_request()?;
        // The seed is only consumed by a request that can go ahead.
        req.validate()?;
        let guard = self.locks.exclusive(&[req.destination.as_path()])?;
        if args.use_entropy && req.token_type != TokenType::None {
            req.key_source = Some(KeySource::Entropy(self.take_seed()?));
        }
        Ok((guard, req))
    }

    /// Seal a folder into a new container.
    ///
    /// Must be called within a tokio runtime.
    pub fn run_encrypt(&self, args: EncryptArgs) -> JobHandle {
        let prepared = self.prepare_encrypt(&args);
        let config = Arc::clone(&self.config);
        job::spawn(JobKind::Encrypt, None, move |reporter| {
            let (_guard, req) = prepared?;
            info!(path = %req.destination.display(), token_type = %req.token_type, "Encrypt started");
            let outcome = seal::seal(&req, &config, reporter)?;
            if req.token_sink == TokenSink::Stdout && !outcome.tokens.is_empty() {
                let text = outcome.tokens.render(TokenFormat::Plaintext)?;
                for line in text.lines() {
                    reporter.stdout(line);
                }
            }
            Ok(JobOutput::Tokens(outcome.tokens))
        })
    }

    fn prepare_decrypt(&self, args: &DecryptArgs) -> EngineResult<(PathGuard, UnsealRequest)> {
        let container = PathBuf::from(&args.container_path);
        let req = UnsealRequest {
            credentials: args.credentials()?,
            integrity_password: args.integrity_password(),
            destination: PathBuf::from(&args.folder_path),
            container,
        };
        let guard = self.locks.shared(&req.container)?;
        Ok((guard, req))
    }

    /// Restore a container into a folder.
    ///
    /// Must be called within a tokio runtime.
    pub fn run_decrypt(&self, args: DecryptArgs) -> JobHandle {
        let prepared = self.prepare_decrypt(&args);
        job::spawn(JobKind::Decrypt, None, move |reporter| {
            let (_guard, req) = prepared?;
            info!(path = %req.container.display(), "Decrypt started");
            let outcome = unseal::unseal(&req, reporter)?;
            Ok(JobOutput::Folder {
                folder_path: outcome.folder.to_string_lossy().into_owned(),
            })
        })
    }

    fn prepare_reseal(&self, args: &ResealArgs) -> EngineResult<(PathGuard, ResealRequest)> {
        let req = args.to_request()?;
        let guard = self
            .locks
            .exclusive(&[req.current_path.as_path(), req.target()])?;
        Ok((guard, req))
    }

    /// Re-encrypt a container from its mount folder.
    ///
    /// Must be called within a tokio runtime.
    pub fn run_reseal(&self, args: ResealArgs) -> JobHandle {
        let prepared = self.prepare_reseal(&args);
        let config = Arc::clone(&self.config);
        job::spawn(JobKind::Reseal, None, move |reporter| {
            let (_guard, req) = prepared?;
            info!(path = %req.current_path.display(), rekey = req.rekey.is_requested(), "Reseal started");
            let outcome = reseal::reseal(&req, &config, reporter)?;
            Ok(JobOutput::Resealed {
                path: outcome.path.to_string_lossy().into_owned(),
                tokens: outcome.tokens,
            })
        })
    }

    fn read_info(&self, path: &str) -> EngineResult<scanner::ContainerInfo> {
        let path = Path::new(path);
        if !path.as_os_str().is_empty() {
            self.locks.ensure_not_writing(path)?;
        }
        scanner::info(path)
    }

    /// Read a container header in the background.
    ///
    /// Bridge events for this job carry the path as context.
    pub fn run_container_info(&self, args: ContainerInfoArgs) -> JobHandle {
        let engine = self.clone();
        let path = args.path;
        job::spawn(JobKind::Info, Some(path.clone()), move |_| {
            engine.read_info(&path).map(JobOutput::Info)
        })
    }

    /// Read a container header synchronously.
    pub fn container_info_once(&self, args: &ContainerInfoArgs) -> InfoResult {
        InfoResult::from_result(args.path.clone(), self.read_info(&args.path))
    }

    /// List container files directly inside `path`.
    pub fn scan_containers_directory(&self, path: &str) -> EngineResult<Vec<String>> {
        scanner::scan(Path::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tvault_common::ErrorCode;
    use tvault_crypto::KdfParams;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn engine() -> Engine {
        let kdf = KdfParams {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        };
        Engine::new(EngineConfig {
            kdf,
            integrity_kdf: kdf,
            entropy_target_bits: 256,
            ..EngineConfig::default()
        })
    }

    fn noise(seed: u64) -> Vec<u8> {
        let mut bytes = vec![0u8; 256];
        StdRng::seed_from_u64(seed).fill_bytes(&mut bytes);
        bytes
    }

    fn fill_entropy(engine: &Engine) {
        for seed in 100..164 {
            if engine.entropy_ready() {
                break;
            }
            engine.entropy_batch(&noise(seed));
        }
        assert!(engine.entropy_ready());
    }

    fn source_folder(root: &Path) -> PathBuf {
        let folder = root.join("src");
        fs::create_dir_all(folder.join("inner")).unwrap();
        fs::write(folder.join("a.txt"), b"alpha").unwrap();
        fs::write(folder.join("inner").join("b.bin"), [7u8; 300]).unwrap();
        folder
    }

    fn encrypt_args(root: &Path, token_type: &str) -> EncryptArgs {
        EncryptArgs {
            container_path: root.join("c.tvlt").to_string_lossy().into_owned(),
            folder_path: source_folder(root).to_string_lossy().into_owned(),
            token_type: token_type.into(),
            passphrase: Some("pw".into()),
            ..EncryptArgs::default()
        }
    }

    #[tokio::test]
    async fn test_encrypt_then_decrypt() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let args = encrypt_args(dir.path(), "master");
        let container = args.container_path.clone();

        let report = engine.run_encrypt(args).wait(engine.job_timeout()).await.unwrap();
        assert_eq!(report.progress.last(), Some(&100));
        let Ok(JobOutput::Tokens(tokens)) = report.result else {
            panic!("unexpected result");
        };
        let master = tokens.master_token.clone().unwrap();
        assert_eq!(report.stdout, vec![master.clone()]);

        let out = dir.path().join("out");
        let args = DecryptArgs {
            container_path: container,
            folder_path: out.to_string_lossy().into_owned(),
            master_token: Some(master),
            ..DecryptArgs::default()
        };
        let report = engine.run_decrypt(args).wait(engine.job_timeout()).await.unwrap();
        assert!(matches!(report.result, Ok(JobOutput::Folder { .. })));
        assert_eq!(fs::read(out.join("a.txt")).unwrap(), b"alpha");
        assert!(!engine.locks().is_locked(&dir.path().join("c.tvlt")));
    }

    #[tokio::test]
    async fn test_busy_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let path = dir.path().join("c.tvlt");
        let _held = engine.locks().exclusive(&[path.as_path()]).unwrap();

        let report = engine
            .run_encrypt(encrypt_args(dir.path(), "none"))
            .wait(engine.job_timeout())
            .await
            .unwrap();
        let err = report.result.unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::ContainerBusy));
        assert!(report.progress.is_empty());

        let result = engine.container_info_once(&ContainerInfoArgs {
            path: path.to_string_lossy().into_owned(),
        });
        assert_eq!(
            result.error.unwrap().error_code(),
            Some(ErrorCode::ContainerBusy)
        );
    }

    #[tokio::test]
    async fn test_entropy_sealing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let mut args = encrypt_args(dir.path(), "share");
        args.passphrase = None;
        args.use_entropy = true;

        let report = engine
            .run_encrypt(args.clone())
            .wait(engine.job_timeout())
            .await
            .unwrap();
        assert_eq!(
            report.result.unwrap_err().error_code(),
            Some(ErrorCode::EntropyInsufficient)
        );
        assert!(!engine.locks().is_locked(Path::new(&args.container_path)));

        // Rotations of one batch never reach the target.
        let batch = noise(0);
        let first = engine.entropy_batch(&batch);
        for shift in 1..16 {
            let mut rotated = batch.clone();
            rotated.rotate_left(shift);
            assert_eq!(engine.entropy_batch(&rotated), first);
        }
        assert!(!engine.entropy_ready());

        fill_entropy(&engine);

        let report = engine.run_encrypt(args).wait(engine.job_timeout()).await.unwrap();
        let Ok(JobOutput::Tokens(tokens)) = report.result else {
            panic!("unexpected result");
        };
        assert_eq!(tokens.token_list.as_ref().unwrap().len(), 5);
        assert_eq!(&report.stdout, tokens.token_list.as_ref().unwrap());
        assert!(!engine.entropy_ready());
    }

    #[tokio::test]
    async fn test_rejected_seal_keeps_entropy() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        fill_entropy(&engine);

        let mut args = encrypt_args(dir.path(), "share");
        args.passphrase = None;
        args.use_entropy = true;
        args.is_shamir_enabled = true;
        args.number_of_shares = Some(3);
        args.threshold = Some(1);
        let report = engine
            .run_encrypt(args.clone())
            .wait(engine.job_timeout())
            .await
            .unwrap();
        assert_eq!(
            report.result.unwrap_err().error_code(),
            Some(ErrorCode::ShamirThresholdLessThanTwo)
        );
        assert!(engine.entropy_ready());

        let mut missing_folder = args.clone();
        missing_folder.threshold = Some(2);
        missing_folder.folder_path = dir.path().join("absent").to_string_lossy().into_owned();
        let report = engine
            .run_encrypt(missing_folder)
            .wait(engine.job_timeout())
            .await
            .unwrap();
        assert_eq!(
            report.result.unwrap_err().error_code(),
            Some(ErrorCode::ContainerFolderPathRequired)
        );
        assert!(engine.entropy_ready());

        args.threshold = Some(2);
        let report = engine.run_encrypt(args).wait(engine.job_timeout()).await.unwrap();
        assert!(report.result.is_ok());
        assert!(!engine.entropy_ready());
    }

    #[tokio::test]
    async fn test_info_job_carries_path() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let args = encrypt_args(dir.path(), "none");
        let container = args.container_path.clone();
        engine.run_encrypt(args).wait(engine.job_timeout()).await.unwrap();

        let handle = engine.run_container_info(ContainerInfoArgs {
            path: container.clone(),
        });
        assert_eq!(handle.context(), Some(container.as_str()));
        let report = handle.wait(engine.job_timeout()).await.unwrap();
        let Ok(JobOutput::Info(info)) = report.result else {
            panic!("unexpected result");
        };
        assert_eq!(info.name, "c");

        let missing = engine.container_info_once(&ContainerInfoArgs {
            path: dir.path().join("nope.tvlt").to_string_lossy().into_owned(),
        });
        assert!(missing.data.is_none());
        assert_eq!(
            missing.error.unwrap().error_code(),
            Some(ErrorCode::ContainerOpenFile)
        );

        let found = engine
            .scan_containers_directory(&dir.path().to_string_lossy())
            .unwrap();
        assert_eq!(found, vec![container]);
    }

    /// Ten files, five shares with threshold three, hmac integrity.
    #[tokio::test]
    async fn test_share_hmac_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let folder = dir.path().join("ten");
        fs::create_dir(&folder).unwrap();
        for i in 0..10 {
            fs::write(folder.join(format!("file{i}.txt")), format!("content {i}")).unwrap();
        }
        let container = dir.path().join("ten.tvlt").to_string_lossy().into_owned();

        let args = EncryptArgs {
            container_path: container.clone(),
            folder_path: folder.to_string_lossy().into_owned(),
            token_type: "share".into(),
            is_shamir_enabled: true,
            number_of_shares: Some(5),
            threshold: Some(3),
            integrity_provider: "hmac".into(),
            additional_password: Some("integrity".into()),
            ..EncryptArgs::default()
        };
        let report = engine.run_encrypt(args).wait(engine.job_timeout()).await.unwrap();
        let Ok(JobOutput::Tokens(tokens)) = report.result else {
            panic!("unexpected result");
        };
        let shares = tokens.token_list.clone().unwrap();
        assert_eq!(shares.len(), 5);
        let mut distinct = shares.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 5);

        let decrypt = |picked: Vec<String>, password: &str, out: &str| DecryptArgs {
            container_path: container.clone(),
            folder_path: dir.path().join(out).to_string_lossy().into_owned(),
            token_reader_type: Some("flag".into()),
            token_format: Some("plaintext".into()),
            token_flag: Some(picked.join("|")),
            additional_password: Some(password.into()),
            ..DecryptArgs::default()
        };

        for (n, subset) in [[0usize, 1, 2], [0, 2, 4], [1, 3, 4]].iter().enumerate() {
            let picked = subset.iter().map(|&i| shares[i].clone()).collect();
            let out = format!("out{n}");
            let report = engine
                .run_decrypt(decrypt(picked, "integrity", &out))
                .wait(engine.job_timeout())
                .await
                .unwrap();
            assert!(report.result.is_ok());
            for i in 0..10 {
                let restored = fs::read_to_string(dir.path().join(&out).join(format!("file{i}.txt")));
                assert_eq!(restored.unwrap(), format!("content {i}"));
            }
        }

        let report = engine
            .run_decrypt(decrypt(shares[..2].to_vec(), "integrity", "two"))
            .wait(engine.job_timeout())
            .await
            .unwrap();
        assert_eq!(
            report.result.unwrap_err().error_code(),
            Some(ErrorCode::ShamirNotEnoughShares)
        );

        let report = engine
            .run_decrypt(decrypt(shares[2..].to_vec(), "wrong", "bad"))
            .wait(engine.job_timeout())
            .await
            .unwrap();
        assert_eq!(
            report.result.unwrap_err().error_code(),
            Some(ErrorCode::IntegrityVerificationFailed)
        );
        // Stopped before decrypting or unpacking.
        assert!(report.progress.iter().all(|&p| p < 60));
        assert!(!dir.path().join("bad").exists());
    }

    #[test]
    fn test_path_commands() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let nested = dir.path().join("a").join("c.tvlt");
        let nested = nested.to_string_lossy();

        engine.check_container_path(&nested, false).unwrap();
        assert!(dir.path().join("a").is_dir());
        assert!(!engine.check_file_exists(&nested));

        fs::write(&*nested, b"x").unwrap();
        assert!(engine.check_file_exists(&nested));
        assert_eq!(
            engine.check_container_path(&nested, false).unwrap_err().code(),
            ErrorCode::ContainerPathExists
        );
        engine.check_container_path(&nested, true).unwrap();

        let target = dir.path().join("a").to_string_lossy().into_owned();
        engine.remove_dir(&target, true).unwrap();
        engine.remove_dir(&target, true).unwrap();
        assert!(!dir.path().join("a").exists());
    }
}
