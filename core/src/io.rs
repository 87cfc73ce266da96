// portflow/src/io.rs

//! Resolution of hrefs to byte streams, for document bindings, loads, stores and logs.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Write};
use std::sync::Arc;
use url::Url;

pub trait InputResolver: Send + Sync + 'static {
  fn resolve_input(&self, href: &str, base: Option<&str>) -> Result<Box<dyn Read + Send>>;
}

pub trait OutputResolver: Send + Sync + 'static {
  fn resolve_output(&self, href: &str, base: Option<&str>) -> Result<Box<dyn Write + Send>>;
}

/// Resolves `href` against `base`. Relative hrefs without a base resolve against the
/// current directory.
pub fn resolve_uri(href: &str, base: Option<&str>) -> Result<Url> {
  if let Ok(absolute) = Url::parse(href) {
    // A single letter scheme is a Windows drive, not a URL.
    if absolute.scheme().len() > 1 {
      return Ok(absolute);
    }
  }
  let base = match base {
    Some(base) => match Url::parse(base) {
      Ok(url) => url,
      Err(_) => Url::from_file_path(std::path::absolute(base)?)
        .map_err(|_| anyhow!("Base '{}' is not a usable path", base))?,
    },
    None => {
      let cwd = std::env::current_dir()?;
      Url::from_directory_path(&cwd).map_err(|_| anyhow!("Current directory '{}' is not absolute", cwd.display()))?
    }
  };
  base
    .join(href)
    .with_context(|| format!("Cannot resolve '{}' against '{}'", href, base))
}

/// Local files, addressed by path or `file:` URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileResolver;

impl FileResolver {
  fn path(href: &str, base: Option<&str>) -> Result<std::path::PathBuf> {
    let url = resolve_uri(href, base)?;
    if url.scheme() != "file" {
      bail!("Unsupported URI scheme '{}' in '{}'", url.scheme(), url);
    }
    url.to_file_path().map_err(|_| anyhow!("'{}' does not denote a local file", url))
  }
}

impl InputResolver for FileResolver {
  fn resolve_input(&self, href: &str, base: Option<&str>) -> Result<Box<dyn Read + Send>> {
    let path = Self::path(href, base)?;
    let file = File::open(&path).with_context(|| format!("Cannot open '{}'", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
  }
}

impl OutputResolver for FileResolver {
  fn resolve_output(&self, href: &str, base: Option<&str>) -> Result<Box<dyn Write + Send>> {
    let path = Self::path(href, base)?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).with_context(|| format!("Cannot create '{}'", parent.display()))?;
    }
    let file = File::create(&path).with_context(|| format!("Cannot create '{}'", path.display()))?;
    Ok(Box::new(file))
  }
}

#[derive(Default)]
struct MemoryStore {
  resources: HashMap<String, Vec<u8>>,
  writes: Vec<String>,
}

/// An in-memory resource store. Clones share the same store.
///
/// Keys are hrefs resolved against the base when the base is an absolute URL, the bare
/// href otherwise. Written content becomes visible when the writer is dropped.
#[derive(Clone, Default)]
pub struct MemoryResolver {
  store: Arc<Mutex<MemoryStore>>,
}

impl MemoryResolver {
  pub fn new() -> Self {
    Self::default()
  }

  fn key(href: &str, base: Option<&str>) -> String {
    match base.map(Url::parse) {
      Some(Ok(base)) => base.join(href).map(String::from).unwrap_or_else(|_| href.to_string()),
      _ => href.to_string(),
    }
  }

  pub fn insert(&self, href: impl Into<String>, content: impl Into<Vec<u8>>) {
    self.store.lock().resources.insert(href.into(), content.into());
  }

  pub fn with(self, href: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
    self.insert(href, content);
    self
  }

  pub fn get(&self, href: &str) -> Option<Vec<u8>> {
    self.store.lock().resources.get(href).cloned()
  }

  pub fn get_string(&self, href: &str) -> Option<String> {
    self.get(href).and_then(|bytes| String::from_utf8(bytes).ok())
  }

  /// Keys written so far, in completion order.
  pub fn writes(&self) -> Vec<String> {
    self.store.lock().writes.clone()
  }
}

impl InputResolver for MemoryResolver {
  fn resolve_input(&self, href: &str, base: Option<&str>) -> Result<Box<dyn Read + Send>> {
    let key = Self::key(href, base);
    let content = self
      .store
      .lock()
      .resources
      .get(&key)
      .cloned()
      .ok_or_else(|| anyhow!("No resource '{}'", key))?;
    Ok(Box::new(Cursor::new(content)))
  }
}

impl OutputResolver for MemoryResolver {
  fn resolve_output(&self, href: &str, base: Option<&str>) -> Result<Box<dyn Write + Send>> {
    Ok(Box::new(MemoryWriter {
      key: Self::key(href, base),
      buffer: Vec::new(),
      store: Arc::clone(&self.store),
    }))
  }
}

struct MemoryWriter {
  key: String,
  buffer: Vec<u8>,
  store: Arc<Mutex<MemoryStore>>,
}

impl Write for MemoryWriter {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.buffer.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> std::io::Result<()> {
    Ok(())
  }
}

impl Drop for MemoryWriter {
  fn drop(&mut self) {
    let mut store = self.store.lock();
    store.resources.insert(self.key.clone(), std::mem::take(&mut self.buffer));
    store.writes.push(self.key.clone());
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn relative_hrefs_join_the_base() {
    let url = resolve_uri("out/a.xml", Some("file:///tmp/work/")).unwrap();
    assert_eq!(url.as_str(), "file:///tmp/work/out/a.xml");
    let url = resolve_uri("http://example.org/x", Some("file:///tmp/")).unwrap();
    assert_eq!(url.as_str(), "http://example.org/x");
  }

  #[test]
  fn memory_resolver_round_trips_and_records_writes() {
    let resolver = MemoryResolver::new();
    {
      let mut out = resolver.resolve_output("a.xml", Some("mem:/base/")).unwrap();
      out.write_all(b"<a/>").unwrap();
    }
    assert_eq!(resolver.writes(), vec!["mem:/base/a.xml".to_string()]);
    let mut content = String::new();
    resolver
      .resolve_input("a.xml", Some("mem:/base/"))
      .unwrap()
      .read_to_string(&mut content)
      .unwrap();
    assert_eq!(content, "<a/>");
    assert!(resolver.resolve_input("missing.xml", None).is_err());
  }

  #[test]
  fn file_resolver_writes_and_reads_files() {
    let dir = std::env::temp_dir().join(format!("portflow-io-{}", std::process::id()));
    let base = Url::from_directory_path(&dir).unwrap().to_string();
    {
      let mut out = FileResolver.resolve_output("nested/doc.xml", Some(&base)).unwrap();
      out.write_all(b"<doc/>").unwrap();
    }
    let mut content = String::new();
    FileResolver
      .resolve_input("nested/doc.xml", Some(&base))
      .unwrap()
      .read_to_string(&mut content)
      .unwrap();
    assert_eq!(content, "<doc/>");
    let _ = fs::remove_dir_all(&dir);
  }
}
