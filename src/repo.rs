//! Obtención de los ficheros indexables del repositorio.
//!
//! El núcleo sólo consume una secuencia ordenada de `Document`
//! (ruta relativa + texto); clonar y autenticar queda aquí.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};
use url::Url;
use walkdir::{DirEntry, WalkDir};

use crate::config::RepoConfig;
use crate::error::{PipelineError, Result};
use crate::models::Document;

/// Extensiones que se indexan.
pub const INDEXABLE_EXTENSIONS: &[&str] = &[
    "py", "md", "txt", "yaml", "yml", "json", "js", "ts", "html", "css", "ipynb", "rs", "toml",
];

/// Directorios que nunca se recorren.
pub const EXCLUDED_DIRS: &[&str] = &[
    "venv", "__pycache__", ".git", ".github", "node_modules", "dist", "build",
];

#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Documentos ordenados por ruta.
    async fn fetch(&self) -> Result<Vec<Document>>;
}

/// Árbol ya presente en disco.
pub struct LocalDirectory {
    root: PathBuf,
}

impl LocalDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl RepoSource for LocalDirectory {
    async fn fetch(&self) -> Result<Vec<Document>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || read_tree(&root))
            .await
            .map_err(|e| PipelineError::Fetch(format!("tarea de lectura abortada: {e}")))?
    }
}

/// Clon superficial (`git clone --depth 1`) en un directorio temporal.
pub struct GitCheckout {
    url: String,
    branch: String,
    access_token: Option<String>,
}

impl GitCheckout {
    pub fn new(url: &str, branch: &str, access_token: Option<String>) -> Self {
        Self {
            url: url.to_string(),
            branch: branch.to_string(),
            access_token,
        }
    }

    /// URL de clonado con el token inyectado como credencial HTTPS.
    fn clone_url(&self) -> Result<String> {
        let Some(token) = &self.access_token else {
            return Ok(self.url.clone());
        };
        let mut url = Url::parse(&self.url)
            .map_err(|e| PipelineError::Fetch(format!("URL de repositorio inválida: {e}")))?;
        if url.scheme() != "https" {
            return Ok(self.url.clone());
        }
        url.set_username("x-access-token")
            .and_then(|_| url.set_password(Some(token.as_str())))
            .map_err(|_| PipelineError::Fetch("no se pudo inyectar el token en la URL".into()))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl RepoSource for GitCheckout {
    async fn fetch(&self) -> Result<Vec<Document>> {
        let workdir = tempfile::tempdir()
            .map_err(|e| PipelineError::Fetch(format!("no se pudo crear el directorio temporal: {e}")))?;
        let dest = workdir.path().join("repo");

        info!("Clonando {} (rama {})...", self.url, self.branch);
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--single-branch", "--branch", self.branch.as_str()])
            .arg(self.clone_url()?)
            .arg(&dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(|e| PipelineError::Fetch(format!("no se pudo ejecutar 'git clone': {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // No filtrar el token en el mensaje de error.
            let stderr = match &self.access_token {
                Some(token) => stderr.replace(token.as_str(), "***"),
                None => stderr.into_owned(),
            };
            return Err(PipelineError::Fetch(format!("git clone falló: {}", stderr.trim())));
        }

        // `workdir` se borra al salir de este ámbito.
        LocalDirectory::new(dest).fetch().await
    }
}

/// Elige la fuente según la configuración.
pub fn source_from_config(repo: &RepoConfig) -> Box<dyn RepoSource> {
    match &repo.local_path {
        Some(path) => Box::new(LocalDirectory::new(path.clone())),
        None => Box::new(GitCheckout::new(&repo.url, &repo.branch, repo.access_token.clone())),
    }
}

fn is_excluded_dir(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    entry.depth() > 0 && entry.file_type().is_dir() && EXCLUDED_DIRS.iter().any(|d| name == *d)
}

fn is_indexable(path: &Path) -> bool {
    path.extension()
        .and_then(std::ffi::OsStr::to_str)
        .map(|ext| INDEXABLE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn read_tree(root: &Path) -> Result<Vec<Document>> {
    if !root.is_dir() {
        return Err(PipelineError::Fetch(format!(
            "la ruta no es un directorio: {}",
            root.display()
        )));
    }

    let mut documents = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded_dir(e));

    for entry in walker {
        let entry = entry.map_err(|e| PipelineError::Fetch(e.to_string()))?;
        if !entry.file_type().is_file() || !is_indexable(entry.path()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");

        match std::fs::read_to_string(entry.path()) {
            Ok(text) if text.trim().is_empty() => {
                warn!("Fichero vacío, se omite: {relative}");
            }
            Ok(text) => documents.push(Document::new(relative, text)),
            Err(_) => warn!("Saltando fichero no-texto o no-UTF8: {relative}"),
        }
    }

    documents.sort_by(|a, b| a.path.cmp(&b.path));
    info!("Encontrados {} ficheros indexables en {}", documents.len(), root.display());
    Ok(documents)
}
