//! Staging protocol: the command chain a worker container runs for one step
//!
//! The protocol is kept as a typed list of instructions and only rendered to
//! a single `sh -c` string when the workflow is compiled. Rendering joins the
//! instructions with `&&` so that any failing instruction aborts the chain.

use crate::packaging::ArchiveId;

/// Environment variable carrying the object storage access key inside the worker
pub const ACCESS_KEY_VAR: &str = "NBPIPE_STORAGE_ACCESS_KEY";

/// Environment variable carrying the object storage secret key inside the worker
pub const SECRET_KEY_VAR: &str = "NBPIPE_STORAGE_SECRET_KEY";

/// Kubernetes secret entry a worker environment variable is read from.
///
/// Credentials reach the worker by reference only; their values never
/// appear in a compiled workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretKeyRef {
    /// Secret name in the namespace the workflow runs in
    pub name: String,
    pub key: String,
}

/// Directory the archive is unpacked into
pub const UNPACK_DIR: &str = "jupyter-work-dir";

const STORAGE_CLI: &str = "mc";

/// Where the worker fetches archives from and publishes outputs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCoordinates {
    /// Host alias registered with the storage CLI
    pub alias: String,
    pub endpoint: String,
    pub bucket: String,
    /// Download URL of the storage CLI binary
    pub cli_url: String,
}

impl StorageCoordinates {
    fn object_path(&self, key: &str) -> String {
        format!("{}/{}/{}", self.alias, self.bucket, key)
    }
}

/// One discrete worker instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingInstruction {
    InstallNotebookRunner,
    InstallDownloader,
    FetchStorageCli { url: String },
    /// Credentials are read from [`ACCESS_KEY_VAR`] / [`SECRET_KEY_VAR`]
    ConfigureStorage { alias: String, endpoint: String },
    Download { cli: String, source: String, dest: String },
    MakeDir(String),
    ChangeDir(String),
    Unpack { archive: String, strip_components: u32 },
    ExecuteNotebook { input: String, output: String },
    ConvertToHtml { input: String, output: String },
    Upload { cli: String, local: String, dest: String },
}

impl StagingInstruction {
    /// Render as a single shell command
    pub fn render(&self) -> String {
        match self {
            Self::InstallNotebookRunner => "pip install papermill".to_string(),
            Self::InstallDownloader => "apt install -y wget".to_string(),
            Self::FetchStorageCli { url } => format!(
                "wget -O {cli} {} && chmod +x {cli}",
                shell_quote(url),
                cli = STORAGE_CLI
            ),
            Self::ConfigureStorage { alias, endpoint } => format!(
                "./{} config host add {} {} \"${}\" \"${}\"",
                STORAGE_CLI,
                shell_quote(alias),
                shell_quote(endpoint),
                ACCESS_KEY_VAR,
                SECRET_KEY_VAR
            ),
            Self::Download { cli, source, dest } => format!(
                "{} cp {} {}",
                cli,
                shell_quote(source),
                shell_quote(dest)
            ),
            Self::MakeDir(dir) => format!("mkdir -p {}", shell_quote(dir)),
            Self::ChangeDir(dir) => format!("cd {}", shell_quote(dir)),
            Self::Unpack {
                archive,
                strip_components,
            } => format!(
                "tar -zxvf {} --strip-components={}",
                shell_quote(archive),
                strip_components
            ),
            Self::ExecuteNotebook { input, output } => {
                format!("papermill {} {}", shell_quote(input), shell_quote(output))
            }
            Self::ConvertToHtml { input, output } => format!(
                "jupyter nbconvert --to html {} --output {}",
                shell_quote(input),
                shell_quote(output)
            ),
            Self::Upload { cli, local, dest } => format!(
                "{} cp {} {}",
                cli,
                shell_quote(local),
                shell_quote(dest)
            ),
        }
    }
}

/// Ordered staging instructions for one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingProtocol {
    instructions: Vec<StagingInstruction>,
}

impl StagingProtocol {
    /// Build the protocol for step `name` whose notebook is packed in `archive_id`.
    ///
    /// The worker downloads and unpacks the archive, runs `<name>.ipynb`
    /// with papermill, converts the result to HTML and uploads
    /// `<name>_output.ipynb` and `<name>_output.html` to the same bucket.
    pub fn for_step(name: &str, archive_id: &ArchiveId, coords: &StorageCoordinates) -> Self {
        let local_cli = format!("./{}", STORAGE_CLI);
        let parent_cli = format!("../{}", STORAGE_CLI);
        let executed = format!("{}_output.ipynb", name);
        let report = format!("{}_output.html", name);

        let instructions = vec![
            StagingInstruction::InstallNotebookRunner,
            StagingInstruction::InstallDownloader,
            StagingInstruction::FetchStorageCli {
                url: coords.cli_url.clone(),
            },
            StagingInstruction::ConfigureStorage {
                alias: coords.alias.clone(),
                endpoint: coords.endpoint.clone(),
            },
            StagingInstruction::Download {
                cli: local_cli,
                source: coords.object_path(archive_id.as_str()),
                dest: ".".to_string(),
            },
            StagingInstruction::MakeDir(UNPACK_DIR.to_string()),
            StagingInstruction::ChangeDir(UNPACK_DIR.to_string()),
            StagingInstruction::Unpack {
                archive: format!("../{}", archive_id),
                strip_components: 1,
            },
            StagingInstruction::ExecuteNotebook {
                input: format!("{}.ipynb", name),
                output: executed.clone(),
            },
            StagingInstruction::ConvertToHtml {
                input: executed.clone(),
                output: report.clone(),
            },
            StagingInstruction::Upload {
                cli: parent_cli.clone(),
                local: executed.clone(),
                dest: coords.object_path(&executed),
            },
            StagingInstruction::Upload {
                cli: parent_cli,
                local: report.clone(),
                dest: coords.object_path(&report),
            },
        ];

        Self { instructions }
    }

    pub fn instructions(&self) -> &[StagingInstruction] {
        &self.instructions
    }

    /// Render to one `sh -c` argument
    pub fn render(&self) -> String {
        self.instructions
            .iter()
            .map(StagingInstruction::render)
            .collect::<Vec<_>>()
            .join(" && ")
    }
}

/// Quote a shell word unless it only holds characters that need no quoting
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:@%+=,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
