//! Scheme-tagged inputs.
//!
//! An [`Input`] is the scheme-specific half of a flake reference: an
//! attribute bag plus the logic that decides how it is fetched, whether it
//! can be fetched without a registry lookup, and whether it pins a unique
//! revision. Supported schemes:
//!
//! - `git` — a git repository over any transport (`git+https:`, `git+ssh:`,
//!   `git+file:`, plain `git:`), optionally pinned to a `ref` and/or `rev`.
//! - `github` — the `github:owner/repo[/ref-or-rev]` shorthand.
//! - `tarball` — an archive URL (`https://…/x.tar.gz`, `tarball+http:…`).
//! - `path` — a local directory (`path:/some/dir`, `./relative`).
//! - `indirect` — a registry alias (`flake:nixpkgs`, bare `nixpkgs`),
//!   resolved to a direct reference before fetching.
//!
//! Each scheme implements [`InputScheme`]; URL parsing tries the scheme
//! parsers from a fixed table in order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use url::Url;

use crate::attrs::{self, Attr, Attrs, AttrsError};
use crate::hash::{Hash, HashError};

/// Archive extensions recognized as tarball references.
const TARBALL_EXTENSIONS: &[&str] = &[".zip", ".tar", ".tgz", ".tar.gz", ".tar.xz", ".tar.bz2", ".tar.zst"];

/// Errors raised while parsing or manipulating inputs.
#[derive(Debug, Error)]
pub enum InputError {
  /// No scheme recognizes the URL.
  #[error("input '{0}' is unsupported")]
  Unsupported(String),

  /// A reference was recognized but is malformed.
  #[error("invalid flake reference '{url}': {reason}")]
  Invalid { url: String, reason: String },

  /// An attribute is not recognized by the selected scheme.
  #[error("unsupported input attribute '{0}'")]
  UnsupportedAttr(String),

  /// An override cannot be applied to this scheme.
  #[error("cannot apply '{what}' to input '{input}'")]
  OverrideNotSupported { what: String, input: String },

  #[error(transparent)]
  Attrs(#[from] AttrsError),

  #[error(transparent)]
  Hash(#[from] HashError),
}

/// Check whether `s` is a plausible flake id (`[a-zA-Z][a-zA-Z0-9_-]*`).
pub fn is_flake_id(s: &str) -> bool {
  let mut chars = s.chars();
  match chars.next() {
    Some(c) if c.is_ascii_alphabetic() => {}
    _ => return false,
  }
  chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Check whether `s` looks like a full commit hash (40 hex characters).
pub fn is_commit_hash(s: &str) -> bool {
  s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Behavior shared by every input scheme.
pub trait InputScheme: Sized {
  /// The value of the `type` attribute for this scheme.
  const NAME: &'static str;

  /// Try to parse a URL into this scheme. Returns `Ok(None)` if the URL
  /// belongs to a different scheme. Consumed query parameters are removed
  /// from `query`; anything left over is rejected by the caller.
  fn from_url(url: &Url, query: &mut BTreeMap<String, String>) -> Result<Option<Self>, InputError>;

  /// Parse the scheme-specific attributes. Called when `type` matches
  /// [`Self::NAME`]; rejects attributes the scheme does not know.
  fn from_attrs(attrs: &Attrs) -> Result<Self, InputError>;

  /// Serialize the scheme-specific attributes (without `type`).
  fn to_attrs(&self) -> Attrs;

  /// Render the scheme-specific part of the URL form.
  fn print(&self) -> String;

  /// Whether this scheme can fetch without a registry lookup.
  fn is_direct(&self) -> bool {
    true
  }

  /// Whether the scheme's own attributes pin a unique revision.
  fn is_locked(&self) -> bool;

  /// Apply `ref`/`rev` override directives.
  fn apply_overrides(&self, ref_: Option<String>, rev: Option<String>) -> Result<Self, InputError>;
}

fn reject_unknown_attrs(attrs: &Attrs, known: &[&str]) -> Result<(), InputError> {
  for name in attrs.keys() {
    if !known.contains(&name.as_str()) {
      return Err(InputError::UnsupportedAttr(name.clone()));
    }
  }
  Ok(())
}

fn take_rev(query: &mut BTreeMap<String, String>, url: &Url) -> Result<Option<String>, InputError> {
  match query.remove("rev") {
    None => Ok(None),
    Some(rev) if is_commit_hash(&rev) => Ok(Some(rev)),
    Some(rev) => Err(InputError::Invalid {
      url: url.to_string(),
      reason: format!("'{}' is not a commit hash", rev),
    }),
  }
}

// ---------------------------------------------------------------------------
// git
// ---------------------------------------------------------------------------

/// A git repository reachable over some transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitInput {
  /// Transport URL, without the `git+` marker or floc query parameters.
  pub url: String,
  pub ref_: Option<String>,
  pub rev: Option<String>,
}

impl InputScheme for GitInput {
  const NAME: &'static str = "git";

  fn from_url(url: &Url, query: &mut BTreeMap<String, String>) -> Result<Option<Self>, InputError> {
    let transport = match url.scheme() {
      "git" => url.scheme().to_string(),
      "git+http" | "git+https" | "git+ssh" | "git+git" | "git+file" => url.scheme()["git+".len()..].to_string(),
      _ => return Ok(None),
    };

    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.set_fragment(None);
    let base = stripped.as_str();
    let transport_url = if url.scheme() == "git" {
      base.to_string()
    } else {
      format!("{}{}", transport, &base[url.scheme().len()..])
    };

    Ok(Some(GitInput {
      url: transport_url,
      ref_: query.remove("ref"),
      rev: take_rev(query, url)?,
    }))
  }

  fn from_attrs(attrs: &Attrs) -> Result<Self, InputError> {
    reject_unknown_attrs(attrs, &["type", "url", "ref", "rev"])?;
    Ok(GitInput {
      url: attrs::get_str(attrs, "url")?.to_string(),
      ref_: attrs::maybe_get_str(attrs, "ref")?.map(str::to_string),
      rev: attrs::maybe_get_str(attrs, "rev")?.map(str::to_string),
    })
  }

  fn to_attrs(&self) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("url".to_string(), Attr::from(self.url.clone()));
    if let Some(ref_) = &self.ref_ {
      attrs.insert("ref".to_string(), Attr::from(ref_.clone()));
    }
    if let Some(rev) = &self.rev {
      attrs.insert("rev".to_string(), Attr::from(rev.clone()));
    }
    attrs
  }

  fn print(&self) -> String {
    let base = if self.url.starts_with("git://") {
      self.url.clone()
    } else {
      format!("git+{}", self.url)
    };
    let mut params = Vec::new();
    if let Some(ref_) = &self.ref_ {
      params.push(("ref", ref_.clone()));
    }
    if let Some(rev) = &self.rev {
      params.push(("rev", rev.clone()));
    }
    append_params(base, params)
  }

  fn is_locked(&self) -> bool {
    self.rev.is_some()
  }

  fn apply_overrides(&self, ref_: Option<String>, rev: Option<String>) -> Result<Self, InputError> {
    let mut out = self.clone();
    if ref_.is_some() {
      out.ref_ = ref_;
    }
    if rev.is_some() {
      out.rev = rev;
    }
    Ok(out)
  }
}

// ---------------------------------------------------------------------------
// github
// ---------------------------------------------------------------------------

/// The `github:owner/repo` shorthand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubInput {
  pub owner: String,
  pub repo: String,
  pub ref_: Option<String>,
  pub rev: Option<String>,
}

impl InputScheme for GithubInput {
  const NAME: &'static str = "github";

  fn from_url(url: &Url, query: &mut BTreeMap<String, String>) -> Result<Option<Self>, InputError> {
    if url.scheme() != "github" {
      return Ok(None);
    }

    let invalid = |reason: &str| InputError::Invalid {
      url: url.to_string(),
      reason: reason.to_string(),
    };

    let segments: Vec<&str> = url.path().split('/').collect();
    let (owner, repo, pin) = match segments.as_slice() {
      [owner, repo] => (*owner, *repo, None),
      [owner, repo, pin] => (*owner, *repo, Some(*pin)),
      _ => return Err(invalid("expected 'github:owner/repo[/ref-or-rev]'")),
    };

    let (mut ref_, mut rev) = (None, None);
    if let Some(pin) = pin {
      if is_commit_hash(pin) {
        rev = Some(pin.to_string());
      } else {
        ref_ = Some(pin.to_string());
      }
    }
    if let Some(q) = query.remove("ref") {
      if ref_.is_some() {
        return Err(invalid("both a branch in the path and a 'ref' parameter"));
      }
      ref_ = Some(q);
    }
    if let Some(q) = take_rev(query, url)? {
      if rev.is_some() {
        return Err(invalid("both a revision in the path and a 'rev' parameter"));
      }
      rev = Some(q);
    }

    Ok(Some(GithubInput {
      owner: owner.to_string(),
      repo: repo.to_string(),
      ref_,
      rev,
    }))
  }

  fn from_attrs(attrs: &Attrs) -> Result<Self, InputError> {
    reject_unknown_attrs(attrs, &["type", "owner", "repo", "ref", "rev"])?;
    Ok(GithubInput {
      owner: attrs::get_str(attrs, "owner")?.to_string(),
      repo: attrs::get_str(attrs, "repo")?.to_string(),
      ref_: attrs::maybe_get_str(attrs, "ref")?.map(str::to_string),
      rev: attrs::maybe_get_str(attrs, "rev")?.map(str::to_string),
    })
  }

  fn to_attrs(&self) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("owner".to_string(), Attr::from(self.owner.clone()));
    attrs.insert("repo".to_string(), Attr::from(self.repo.clone()));
    if let Some(ref_) = &self.ref_ {
      attrs.insert("ref".to_string(), Attr::from(ref_.clone()));
    }
    if let Some(rev) = &self.rev {
      attrs.insert("rev".to_string(), Attr::from(rev.clone()));
    }
    attrs
  }

  fn print(&self) -> String {
    let mut out = format!("github:{}/{}", self.owner, self.repo);
    if let Some(rev) = &self.rev {
      out.push('/');
      out.push_str(rev);
    } else if let Some(ref_) = &self.ref_ {
      out.push('/');
      out.push_str(ref_);
    }
    out
  }

  fn is_locked(&self) -> bool {
    self.rev.is_some()
  }

  fn apply_overrides(&self, ref_: Option<String>, rev: Option<String>) -> Result<Self, InputError> {
    let mut out = self.clone();
    if ref_.is_some() {
      out.ref_ = ref_;
      out.rev = None;
    }
    if rev.is_some() {
      out.rev = rev;
    }
    Ok(out)
  }
}

// ---------------------------------------------------------------------------
// tarball
// ---------------------------------------------------------------------------

/// An archive fetched over HTTP or from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballInput {
  /// Transport URL, including any query parameters of its own.
  pub url: String,
}

fn has_tarball_extension(path: &str) -> bool {
  TARBALL_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}

impl InputScheme for TarballInput {
  const NAME: &'static str = "tarball";

  fn from_url(url: &Url, query: &mut BTreeMap<String, String>) -> Result<Option<Self>, InputError> {
    let transport = match url.scheme() {
      "http" | "https" | "file" if has_tarball_extension(url.path()) => url.scheme().to_string(),
      "tarball+http" | "tarball+https" | "tarball+file" => url.scheme()["tarball+".len()..].to_string(),
      _ => return Ok(None),
    };

    // Remaining query parameters belong to the transport URL.
    let mut stripped = url.clone();
    stripped.set_fragment(None);
    if query.is_empty() {
      stripped.set_query(None);
    } else {
      let pairs: Vec<(String, String)> = std::mem::take(query).into_iter().collect();
      stripped.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let base = stripped.as_str();
    let transport_url = if url.scheme().starts_with("tarball+") {
      format!("{}{}", transport, &base[url.scheme().len()..])
    } else {
      base.to_string()
    };

    Ok(Some(TarballInput { url: transport_url }))
  }

  fn from_attrs(attrs: &Attrs) -> Result<Self, InputError> {
    reject_unknown_attrs(attrs, &["type", "url"])?;
    Ok(TarballInput {
      url: attrs::get_str(attrs, "url")?.to_string(),
    })
  }

  fn to_attrs(&self) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("url".to_string(), Attr::from(self.url.clone()));
    attrs
  }

  fn print(&self) -> String {
    let path_only = self.url.split('?').next().unwrap_or(&self.url);
    if has_tarball_extension(path_only) {
      self.url.clone()
    } else {
      format!("tarball+{}", self.url)
    }
  }

  fn is_locked(&self) -> bool {
    false
  }

  fn apply_overrides(&self, ref_: Option<String>, rev: Option<String>) -> Result<Self, InputError> {
    if let Some(what) = ref_.or(rev) {
      return Err(InputError::OverrideNotSupported {
        what,
        input: self.print(),
      });
    }
    Ok(self.clone())
  }
}

// ---------------------------------------------------------------------------
// path
// ---------------------------------------------------------------------------

/// A local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInput {
  pub path: PathBuf,
}

impl InputScheme for PathInput {
  const NAME: &'static str = "path";

  fn from_url(url: &Url, _query: &mut BTreeMap<String, String>) -> Result<Option<Self>, InputError> {
    if url.scheme() != "path" {
      return Ok(None);
    }
    Ok(Some(PathInput {
      path: PathBuf::from(url.path()),
    }))
  }

  fn from_attrs(attrs: &Attrs) -> Result<Self, InputError> {
    reject_unknown_attrs(attrs, &["type", "path"])?;
    Ok(PathInput {
      path: PathBuf::from(attrs::get_str(attrs, "path")?),
    })
  }

  fn to_attrs(&self) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("path".to_string(), Attr::from(self.path.display().to_string()));
    attrs
  }

  fn print(&self) -> String {
    format!("path:{}", self.path.display())
  }

  fn is_locked(&self) -> bool {
    false
  }

  fn apply_overrides(&self, ref_: Option<String>, rev: Option<String>) -> Result<Self, InputError> {
    if let Some(what) = ref_.or(rev) {
      return Err(InputError::OverrideNotSupported {
        what,
        input: self.print(),
      });
    }
    Ok(self.clone())
  }
}

// ---------------------------------------------------------------------------
// indirect
// ---------------------------------------------------------------------------

/// A registry alias, resolved to a direct reference before fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectInput {
  pub id: String,
  pub ref_: Option<String>,
  pub rev: Option<String>,
}

impl IndirectInput {
  /// Parse the `id[/ref][/rev]` segment form shared by `flake:` URLs and
  /// bare references.
  pub(crate) fn from_segments(segments: &[&str], url: &str) -> Result<Self, InputError> {
    let invalid = |reason: String| InputError::Invalid {
      url: url.to_string(),
      reason,
    };

    let (id, ref_, rev) = match segments {
      [id] => (*id, None, None),
      [id, pin] if is_commit_hash(pin) => (*id, None, Some(pin.to_string())),
      [id, pin] => (*id, Some(pin.to_string()), None),
      [id, ref_, rev] if is_commit_hash(rev) => (*id, Some(ref_.to_string()), Some(rev.to_string())),
      [_, _, rev] => return Err(invalid(format!("'{}' is not a commit hash", rev))),
      _ => return Err(invalid("expected 'id[/ref][/rev]'".to_string())),
    };

    if !is_flake_id(id) {
      return Err(invalid(format!("'{}' is not a valid flake id", id)));
    }

    Ok(IndirectInput {
      id: id.to_string(),
      ref_,
      rev,
    })
  }
}

impl InputScheme for IndirectInput {
  const NAME: &'static str = "indirect";

  fn from_url(url: &Url, _query: &mut BTreeMap<String, String>) -> Result<Option<Self>, InputError> {
    if url.scheme() != "flake" {
      return Ok(None);
    }
    let segments: Vec<&str> = url.path().split('/').collect();
    Self::from_segments(&segments, url.as_str()).map(Some)
  }

  fn from_attrs(attrs: &Attrs) -> Result<Self, InputError> {
    reject_unknown_attrs(attrs, &["type", "id", "ref", "rev"])?;
    let id = attrs::get_str(attrs, "id")?.to_string();
    if !is_flake_id(&id) {
      return Err(InputError::Invalid {
        url: attrs::attrs_to_json(attrs),
        reason: format!("'{}' is not a valid flake id", id),
      });
    }
    Ok(IndirectInput {
      id,
      ref_: attrs::maybe_get_str(attrs, "ref")?.map(str::to_string),
      rev: attrs::maybe_get_str(attrs, "rev")?.map(str::to_string),
    })
  }

  fn to_attrs(&self) -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert("id".to_string(), Attr::from(self.id.clone()));
    if let Some(ref_) = &self.ref_ {
      attrs.insert("ref".to_string(), Attr::from(ref_.clone()));
    }
    if let Some(rev) = &self.rev {
      attrs.insert("rev".to_string(), Attr::from(rev.clone()));
    }
    attrs
  }

  fn print(&self) -> String {
    let mut out = format!("flake:{}", self.id);
    if let Some(ref_) = &self.ref_ {
      out.push('/');
      out.push_str(ref_);
    }
    if let Some(rev) = &self.rev {
      out.push('/');
      out.push_str(rev);
    }
    out
  }

  fn is_direct(&self) -> bool {
    false
  }

  fn is_locked(&self) -> bool {
    false
  }

  fn apply_overrides(&self, ref_: Option<String>, rev: Option<String>) -> Result<Self, InputError> {
    let mut out = self.clone();
    if ref_.is_some() {
      out.ref_ = ref_;
    }
    if rev.is_some() {
      out.rev = rev;
    }
    Ok(out)
  }
}

// ---------------------------------------------------------------------------
// tagged variant
// ---------------------------------------------------------------------------

/// The scheme-specific part of an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
  Git(GitInput),
  Github(GithubInput),
  Tarball(TarballInput),
  Path(PathInput),
  Indirect(IndirectInput),
}

macro_rules! dispatch {
  ($self:expr, $inner:ident => $body:expr) => {
    match $self {
      Scheme::Git($inner) => $body,
      Scheme::Github($inner) => $body,
      Scheme::Tarball($inner) => $body,
      Scheme::Path($inner) => $body,
      Scheme::Indirect($inner) => $body,
    }
  };
}

impl Scheme {
  pub fn name(&self) -> &'static str {
    match self {
      Scheme::Git(_) => GitInput::NAME,
      Scheme::Github(_) => GithubInput::NAME,
      Scheme::Tarball(_) => TarballInput::NAME,
      Scheme::Path(_) => PathInput::NAME,
      Scheme::Indirect(_) => IndirectInput::NAME,
    }
  }

  fn to_attrs(&self) -> Attrs {
    dispatch!(self, s => s.to_attrs())
  }

  fn print(&self) -> String {
    dispatch!(self, s => s.print())
  }

  fn is_direct(&self) -> bool {
    dispatch!(self, s => s.is_direct())
  }

  fn is_locked(&self) -> bool {
    dispatch!(self, s => s.is_locked())
  }
}

type ParseUrlFn = fn(&Url, &mut BTreeMap<String, String>) -> Result<Option<Scheme>, InputError>;

/// Scheme parsers, tried in order when parsing a URL-form reference.
static SCHEMES: &[ParseUrlFn] = &[
  |url, query| GitInput::from_url(url, query).map(|s| s.map(Scheme::Git)),
  |url, query| GithubInput::from_url(url, query).map(|s| s.map(Scheme::Github)),
  |url, query| TarballInput::from_url(url, query).map(|s| s.map(Scheme::Tarball)),
  |url, query| PathInput::from_url(url, query).map(|s| s.map(Scheme::Path)),
  |url, query| IndirectInput::from_url(url, query).map(|s| s.map(Scheme::Indirect)),
];

/// A complete input: a scheme plus the generic pinning metadata every
/// scheme shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
  pub scheme: Scheme,
  /// Expected (or observed, once fetched) content hash of the tree.
  pub nar_hash: Option<Hash>,
  pub last_modified: Option<u64>,
  pub rev_count: Option<u64>,
}

impl Input {
  pub fn new(scheme: Scheme) -> Self {
    Input {
      scheme,
      nar_hash: None,
      last_modified: None,
      rev_count: None,
    }
  }

  /// Split a URL string into its parsed form and query map.
  pub(crate) fn split_url(url: &str) -> Result<(Url, BTreeMap<String, String>), InputError> {
    let parsed = Url::parse(url).map_err(|_| InputError::Unsupported(url.to_string()))?;
    let query = parsed.query_pairs().into_owned().collect();
    Ok((parsed, query))
  }

  /// Parse an input from a pre-split URL. `query` must already have any
  /// reference-level parameters (e.g. `dir`) removed.
  pub(crate) fn from_split_url(url: &Url, mut query: BTreeMap<String, String>) -> Result<Self, InputError> {
    let nar_hash = query.remove("narHash").map(|s| Hash::parse(&s)).transpose()?;
    let last_modified = take_u64_param(&mut query, "lastModified", url)?;
    let rev_count = take_u64_param(&mut query, "revCount", url)?;

    for parse in SCHEMES {
      if let Some(scheme) = parse(url, &mut query)? {
        if let Some(name) = query.keys().next() {
          return Err(InputError::UnsupportedAttr(name.clone()));
        }
        return Ok(Input {
          scheme,
          nar_hash,
          last_modified,
          rev_count,
        });
      }
    }

    Err(InputError::Unsupported(url.to_string()))
  }

  /// Parse an input from its URL form.
  pub fn from_url(url: &str) -> Result<Self, InputError> {
    let (parsed, query) = Self::split_url(url)?;
    Self::from_split_url(&parsed, query)
  }

  /// Parse an input from an attribute bag, dispatching on `type`.
  pub fn from_attrs(attrs: &Attrs) -> Result<Self, InputError> {
    let mut attrs = attrs.clone();
    let nar_hash = attrs
      .remove("narHash")
      .map(|a| {
        a.as_str()
          .ok_or_else(|| {
            InputError::Attrs(AttrsError::WrongType {
              name: "narHash".to_string(),
              expected: "string",
              got: a.type_name(),
            })
          })
          .and_then(|s| Hash::parse(s).map_err(InputError::Hash))
      })
      .transpose()?;
    let last_modified = attrs::maybe_get_int(&attrs, "lastModified")?;
    attrs.remove("lastModified");
    let rev_count = attrs::maybe_get_int(&attrs, "revCount")?;
    attrs.remove("revCount");

    let type_ = attrs::get_str(&attrs, "type")?;
    let scheme = match type_ {
      GitInput::NAME => Scheme::Git(GitInput::from_attrs(&attrs)?),
      GithubInput::NAME => Scheme::Github(GithubInput::from_attrs(&attrs)?),
      TarballInput::NAME => Scheme::Tarball(TarballInput::from_attrs(&attrs)?),
      PathInput::NAME => Scheme::Path(PathInput::from_attrs(&attrs)?),
      IndirectInput::NAME => Scheme::Indirect(IndirectInput::from_attrs(&attrs)?),
      _ => return Err(InputError::Unsupported(attrs::attrs_to_json(&attrs))),
    };

    Ok(Input {
      scheme,
      nar_hash,
      last_modified,
      rev_count,
    })
  }

  /// Serialize the input to its attribute form, including `type` and the
  /// generic pinning metadata.
  pub fn to_attrs(&self) -> Attrs {
    let mut attrs = self.scheme.to_attrs();
    attrs.insert("type".to_string(), Attr::from(self.scheme.name()));
    if let Some(hash) = &self.nar_hash {
      attrs.insert("narHash".to_string(), Attr::from(hash.to_sri()));
    }
    if let Some(n) = self.last_modified {
      attrs.insert("lastModified".to_string(), Attr::from(n));
    }
    if let Some(n) = self.rev_count {
      attrs.insert("revCount".to_string(), Attr::from(n));
    }
    attrs
  }

  /// Whether this input can be fetched without consulting a registry.
  pub fn is_direct(&self) -> bool {
    self.scheme.is_direct()
  }

  /// Whether this input pins a unique revision (a commit hash or a known
  /// content hash).
  pub fn is_immutable(&self) -> bool {
    self.nar_hash.is_some() || self.scheme.is_locked()
  }

  /// The pinned revision, if any.
  pub fn rev(&self) -> Option<&str> {
    match &self.scheme {
      Scheme::Git(git) => git.rev.as_deref(),
      Scheme::Github(github) => github.rev.as_deref(),
      Scheme::Indirect(indirect) => indirect.rev.as_deref(),
      Scheme::Tarball(_) | Scheme::Path(_) => None,
    }
  }

  pub fn rev_count(&self) -> Option<u64> {
    self.rev_count
  }

  pub fn last_modified(&self) -> Option<u64> {
    self.last_modified
  }

  /// The writable source directory behind this input, if there is one.
  /// Only local inputs have a source path; it is where a modified lock
  /// file is written back to.
  pub fn source_path(&self) -> Option<PathBuf> {
    match &self.scheme {
      Scheme::Path(path) => Some(path.path.clone()),
      Scheme::Git(git) => git.url.strip_prefix("file://").map(PathBuf::from),
      _ => None,
    }
  }

  /// Apply `ref`/`rev` override directives, failing for schemes that do
  /// not support them.
  pub fn apply_overrides(&self, ref_: Option<String>, rev: Option<String>) -> Result<Self, InputError> {
    if ref_.is_none() && rev.is_none() {
      return Ok(self.clone());
    }
    let scheme = match &self.scheme {
      Scheme::Git(git) => Scheme::Git(git.apply_overrides(ref_, rev)?),
      Scheme::Github(github) => Scheme::Github(github.apply_overrides(ref_, rev)?),
      Scheme::Tarball(tarball) => Scheme::Tarball(tarball.apply_overrides(ref_, rev)?),
      Scheme::Path(path) => Scheme::Path(path.apply_overrides(ref_, rev)?),
      Scheme::Indirect(indirect) => Scheme::Indirect(indirect.apply_overrides(ref_, rev)?),
    };
    Ok(Input { scheme, ..self.clone() })
  }
}

impl fmt::Display for Input {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut params = Vec::new();
    if let Some(hash) = &self.nar_hash {
      params.push(("narHash", hash.to_sri()));
    }
    if let Some(n) = self.last_modified {
      params.push(("lastModified", n.to_string()));
    }
    if let Some(n) = self.rev_count {
      params.push(("revCount", n.to_string()));
    }
    write!(f, "{}", append_params(self.scheme.print(), params))
  }
}

/// Append query parameters to a URL string, percent-encoding values.
pub(crate) fn append_params(base: String, params: Vec<(&str, String)>) -> String {
  if params.is_empty() {
    return base;
  }
  let mut out = base;
  for (key, value) in params {
    out.push(if out.contains('?') { '&' } else { '?' });
    out.push_str(key);
    out.push('=');
    out.push_str(&percent_encode(&value));
  }
  out
}

fn percent_encode(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for b in s.bytes() {
    match b {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' | b':' => out.push(b as char),
      _ => out.push_str(&format!("%{:02X}", b)),
    }
  }
  out
}

fn take_u64_param(query: &mut BTreeMap<String, String>, name: &str, url: &Url) -> Result<Option<u64>, InputError> {
  match query.remove(name) {
    None => Ok(None),
    Some(s) => s.parse().map(Some).map_err(|_| InputError::Invalid {
      url: url.to_string(),
      reason: format!("'{}' is not an integer '{}'", name, s),
    }),
  }
}
