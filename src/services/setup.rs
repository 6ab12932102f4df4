use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use super::JobSetupService;
use crate::error::AgentError;
use crate::server::ServerError;
use crate::state_machine::{CleanupStrategy, JobSpecification};

pub const DEPENDENCIES_DIRECTORY: &str = "dependencies";
pub const RUN_SCRIPT: &str = "run";

/// Job directory management on the local filesystem.
///
/// Layout of a job directory:
///
/// ```text
/// <root>/<job_id>/
///     run               generated launcher script
///     dependencies/     downloaded files
///     stdout, stderr    output of non-interactive jobs
/// ```
pub struct LocalJobSetup {
    http: Client,
}

impl LocalJobSetup {
    pub fn new(download_timeout: Duration) -> Result<Self, ServerError> {
        let http = Client::builder().timeout(download_timeout).build()?;
        Ok(Self { http })
    }

    async fn fetch(&self, uri: &str, target: &Path) -> Result<(), AgentError> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let bytes = self
                .download(uri)
                .await
                .map_err(|source| AgentError::Download {
                    uri: uri.to_string(),
                    source,
                })?;
            tokio::fs::write(target, &bytes)
                .await
                .map_err(|e| AgentError::io(format!("failed to write {}", target.display()), e))
        } else {
            let source = uri.strip_prefix("file://").unwrap_or(uri);
            tokio::fs::copy(source, target)
                .await
                .map(|_| ())
                .map_err(|e| AgentError::io(format!("failed to copy dependency {uri}"), e))
        }
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>, ServerError> {
        let response = self.http.get(uri).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ServerError::ApiError {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Last path segment of a dependency URI, without query or fragment.
fn file_name_of(uri: &str) -> Option<&str> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn render_script(spec: &JobSpecification) -> Result<String, AgentError> {
    let command_line = spec.command_line();
    if command_line.is_empty() {
        return Err(AgentError::Launch(format!(
            "job {} has an empty command line",
            spec.job_id
        )));
    }

    let mut script = String::from("#!/usr/bin/env bash\nset -o errexit -o nounset -o pipefail\n\n");
    // BTreeMap iteration keeps the exports sorted by key.
    for (key, value) in &spec.environment_variables {
        script.push_str(&format!("export {key}={}\n", shell_quote(value)));
    }
    if !spec.environment_variables.is_empty() {
        script.push('\n');
    }
    let quoted: Vec<String> = command_line.iter().map(|arg| shell_quote(arg)).collect();
    script.push_str(&format!("exec {}\n", quoted.join(" ")));
    Ok(script)
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

async fn remove_dir_if_present(dir: &Path) -> Result<(), AgentError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AgentError::io(format!("failed to remove {}", dir.display()), e)),
    }
}

#[async_trait]
impl JobSetupService for LocalJobSetup {
    async fn create_job_directory(
        &self,
        root: &Path,
        spec: &JobSpecification,
    ) -> Result<PathBuf, AgentError> {
        let job_dir = root.join(&spec.job_id);
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| AgentError::io(format!("failed to create {}", root.display()), e))?;
        tokio::fs::create_dir(&job_dir).await.map_err(|e| {
            AgentError::io(
                format!("failed to create job directory {}", job_dir.display()),
                e,
            )
        })?;
        tokio::fs::create_dir(job_dir.join(DEPENDENCIES_DIRECTORY))
            .await
            .map_err(|e| AgentError::io("failed to create dependencies directory", e))?;
        info!(job_dir = %job_dir.display(), "Job directory created");
        Ok(job_dir)
    }

    async fn download_job_resources(
        &self,
        spec: &JobSpecification,
        job_dir: &Path,
    ) -> Result<Vec<PathBuf>, AgentError> {
        let target_dir = job_dir.join(DEPENDENCIES_DIRECTORY);
        let mut files = Vec::with_capacity(spec.dependencies.len());
        for uri in &spec.dependencies {
            let name = file_name_of(uri).ok_or_else(|| AgentError::Download {
                uri: uri.clone(),
                source: ServerError::ParseError("dependency URI has no file name".into()),
            })?;
            let target = target_dir.join(name);
            self.fetch(uri, &target).await?;
            debug!(%uri, target = %target.display(), "Dependency downloaded");
            files.push(target);
        }
        Ok(files)
    }

    async fn create_job_script(
        &self,
        spec: &JobSpecification,
        job_dir: &Path,
    ) -> Result<PathBuf, AgentError> {
        let script = render_script(spec)?;
        let path = job_dir.join(RUN_SCRIPT);
        tokio::fs::write(&path, script)
            .await
            .map_err(|e| AgentError::io("failed to write job script", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(|e| AgentError::io("failed to make job script executable", e))?;
        }
        Ok(path)
    }

    async fn archive_job_directory(
        &self,
        job_dir: &Path,
        location: &Path,
    ) -> Result<PathBuf, AgentError> {
        let name = job_dir.file_name().ok_or_else(|| {
            AgentError::InvalidState(format!("job directory {} has no name", job_dir.display()))
        })?;
        let target = location.join(name);
        let (src, dst) = (job_dir.to_path_buf(), target.clone());
        tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
            .await
            .map_err(|e| AgentError::io("archive task failed", io::Error::other(e)))?
            .map_err(|e| AgentError::io(format!("failed to archive to {}", target.display()), e))?;
        info!(archive = %target.display(), "Job directory archived");
        Ok(target)
    }

    async fn cleanup_job_directory(
        &self,
        job_dir: &Path,
        strategy: CleanupStrategy,
    ) -> Result<(), AgentError> {
        match strategy {
            CleanupStrategy::NoCleanup => {}
            CleanupStrategy::Dependencies => {
                remove_dir_if_present(&job_dir.join(DEPENDENCIES_DIRECTORY)).await?
            }
            CleanupStrategy::Full => remove_dir_if_present(job_dir).await?,
        }
        debug!(%strategy, job_dir = %job_dir.display(), "Job directory cleaned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn setup() -> LocalJobSetup {
        LocalJobSetup::new(Duration::from_secs(5)).unwrap()
    }

    fn spec(job_id: &str) -> JobSpecification {
        JobSpecification {
            job_id: job_id.into(),
            executable_args: vec!["echo".into()],
            job_args: vec!["it's done".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn creates_job_directory_with_dependencies_folder() {
        let root = tempfile::tempdir().unwrap();
        let dir = setup()
            .create_job_directory(root.path(), &spec("job-1"))
            .await
            .unwrap();
        assert_eq!(dir, root.path().join("job-1"));
        assert!(dir.join(DEPENDENCIES_DIRECTORY).is_dir());
    }

    #[tokio::test]
    async fn existing_job_directory_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("job-1")).unwrap();
        let err = setup()
            .create_job_directory(root.path(), &spec("job-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Io { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn downloads_file_and_http_dependencies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/files/lib.jar"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jar".to_vec()))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let local = root.path().join("config.yml");
        std::fs::write(&local, "key: value").unwrap();

        let setup = setup();
        let mut spec = spec("job-1");
        spec.dependencies = vec![
            format!("{}/files/lib.jar?version=2", server.uri()),
            format!("file://{}", local.display()),
        ];
        let dir = setup.create_job_directory(root.path(), &spec).await.unwrap();
        let files = setup.download_job_resources(&spec, &dir).await.unwrap();

        assert_eq!(files.len(), 2);
        let deps = dir.join(DEPENDENCIES_DIRECTORY);
        assert_eq!(std::fs::read(deps.join("lib.jar")).unwrap(), b"jar");
        assert_eq!(
            std::fs::read_to_string(deps.join("config.yml")).unwrap(),
            "key: value"
        );
    }

    #[tokio::test]
    async fn missing_http_dependency_fails_with_cause() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("gone"))
            .mount(&server)
            .await;

        let root = tempfile::tempdir().unwrap();
        let setup = setup();
        let mut spec = spec("job-1");
        spec.dependencies = vec![format!("{}/missing.tar.gz", server.uri())];
        let dir = setup.create_job_directory(root.path(), &spec).await.unwrap();
        let err = setup.download_job_resources(&spec, &dir).await.unwrap_err();

        match err {
            AgentError::Download { uri, source } => {
                assert!(uri.ends_with("/missing.tar.gz"));
                assert!(matches!(source, ServerError::ApiError { status: 404, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn dependency_file_names() {
        assert_eq!(file_name_of("https://h/a/b.zip?x=1"), Some("b.zip"));
        assert_eq!(file_name_of("/tmp/data.csv"), Some("data.csv"));
        assert_eq!(file_name_of("https://h/dir/"), None);
    }

    #[test]
    fn script_exports_sorted_quoted_environment() {
        let mut spec = spec("job-1");
        spec.environment_variables =
            BTreeMap::from([("ZED".to_string(), "z".to_string()), ("ALPHA".to_string(), "a b".to_string())]);
        let script = render_script(&spec).unwrap();

        let alpha = script.find("export ALPHA='a b'").unwrap();
        let zed = script.find("export ZED='z'").unwrap();
        assert!(alpha < zed);
        assert!(script.starts_with("#!/usr/bin/env bash\n"));
        assert!(script.ends_with("exec 'echo' 'it'\\''s done'\n"));
    }

    #[test]
    fn empty_command_line_is_a_launch_error() {
        let spec = JobSpecification {
            job_id: "job-1".into(),
            ..Default::default()
        };
        assert!(matches!(render_script(&spec), Err(AgentError::Launch(_))));
    }

    #[tokio::test]
    async fn cleanup_strategies() {
        let root = tempfile::tempdir().unwrap();
        let setup = setup();
        for (job, strategy) in [
            ("none", CleanupStrategy::NoCleanup),
            ("deps", CleanupStrategy::Dependencies),
            ("full", CleanupStrategy::Full),
        ] {
            let dir = setup.create_job_directory(root.path(), &spec(job)).await.unwrap();
            setup.cleanup_job_directory(&dir, strategy).await.unwrap();
            match strategy {
                CleanupStrategy::NoCleanup => assert!(dir.join(DEPENDENCIES_DIRECTORY).exists()),
                CleanupStrategy::Dependencies => {
                    assert!(dir.exists());
                    assert!(!dir.join(DEPENDENCIES_DIRECTORY).exists());
                }
                CleanupStrategy::Full => assert!(!dir.exists()),
            }
        }
    }

    #[tokio::test]
    async fn archive_copies_the_whole_directory() {
        let root = tempfile::tempdir().unwrap();
        let archive = tempfile::tempdir().unwrap();
        let setup = setup();
        let dir = setup.create_job_directory(root.path(), &spec("job-1")).await.unwrap();
        std::fs::write(dir.join("stdout"), "hello").unwrap();
        std::fs::write(dir.join(DEPENDENCIES_DIRECTORY).join("lib.jar"), "jar").unwrap();

        let target = setup
            .archive_job_directory(&dir, archive.path())
            .await
            .unwrap();

        assert_eq!(target, archive.path().join("job-1"));
        assert_eq!(std::fs::read_to_string(target.join("stdout")).unwrap(), "hello");
        assert!(target.join(DEPENDENCIES_DIRECTORY).join("lib.jar").is_file());
    }
}
