//! Shared scaffolding for the locking scenarios: a mock transport backend
//! serving temp-directory repositories, a mock evaluator reading JSON
//! manifests, and a fixture wiring them to a local store and registry.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use floc_core::fetch::{FetchError, Fetcher, Tree};
use floc_core::input::{GithubInput, Input, Scheme};
use floc_core::reference::FlakeRef;
use floc_core::registry::MemoryRegistry;
use floc_core::store::{LocalStore, Store};
use floc_lib::eval::{EvalError, EvalState, Evaluator, Lambda, Value};

/// Commit hashes used by the scenarios.
pub const REV_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub const REV_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
pub const REV_B2: &str = "b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2b2";
pub const REV_M: &str = "1111111111111111111111111111111111111111";

/// A manifest with no inputs.
pub const MINIMAL_FLAKE: &str = r#"{ "outputs": { "__formals": ["self"] } }"#;

#[derive(Default)]
struct MockRepo {
  head: String,
  refs: BTreeMap<String, String>,
  revs: BTreeMap<String, PathBuf>,
}

/// A transport backend serving pre-registered directories.
///
/// Repositories are keyed by the reference form without any pin, e.g.
/// `github:NixOS/nixpkgs`. Path inputs are served from the filesystem
/// directly. Every fetch copies the tree into the store and reports the
/// content hash, like a real backend would.
pub struct MockFetcher {
  store: LocalStore,
  repos: RefCell<BTreeMap<String, MockRepo>>,
  changed: RefCell<Vec<String>>,
}

impl MockFetcher {
  pub fn new(store: LocalStore) -> Self {
    MockFetcher {
      store,
      repos: RefCell::new(BTreeMap::new()),
      changed: RefCell::new(Vec::new()),
    }
  }

  pub fn register_rev(&self, key: &str, rev: &str, dir: PathBuf) {
    let mut repos = self.repos.borrow_mut();
    let repo = repos.entry(key.to_string()).or_default();
    if repo.head.is_empty() {
      repo.head = rev.to_string();
    }
    repo.revs.insert(rev.to_string(), dir);
  }

  pub fn set_head(&self, key: &str, rev: &str) {
    if let Some(repo) = self.repos.borrow_mut().get_mut(key) {
      repo.head = rev.to_string();
    }
  }

  pub fn set_ref(&self, key: &str, name: &str, rev: &str) {
    if let Some(repo) = self.repos.borrow_mut().get_mut(key) {
      repo.refs.insert(name.to_string(), rev.to_string());
    }
  }

  /// Relative paths recorded through `mark_changed_file`.
  pub fn changed_files(&self) -> Vec<String> {
    self.changed.borrow().clone()
  }

  fn failure(input: &Input, reason: &str) -> FetchError {
    FetchError::Failure {
      url: input.to_string(),
      reason: reason.to_string(),
    }
  }

  fn fetch_dir(&self, dir: &Path, input: &Input) -> Result<Tree, FetchError> {
    if !dir.exists() {
      return Err(Self::failure(input, "tree does not exist"));
    }
    let (store_path, hash) = self.store.add_path("source", dir)?;
    Ok(Tree {
      actual_path: self.store.to_real_path(&store_path),
      store_path,
      nar_hash: Some(hash),
    })
  }
}

impl Fetcher for MockFetcher {
  fn fetch(&self, _store: &dyn Store, input: &Input) -> Result<(Tree, Input), FetchError> {
    match &input.scheme {
      Scheme::Path(path) => {
        let tree = self.fetch_dir(&path.path, input)?;
        let mut locked = input.clone();
        locked.nar_hash = tree.nar_hash;
        locked.last_modified = Some(1733660000);
        Ok((tree, locked))
      }

      Scheme::Github(github) => {
        let key = format!("github:{}/{}", github.owner, github.repo);
        let (rev, dir) = {
          let repos = self.repos.borrow();
          let repo = repos.get(&key).ok_or_else(|| Self::failure(input, "unknown repository"))?;
          let rev = match (&github.rev, &github.ref_) {
            (Some(rev), _) => rev.clone(),
            (None, Some(branch)) => repo
              .refs
              .get(branch)
              .ok_or_else(|| Self::failure(input, "unknown branch"))?
              .clone(),
            (None, None) => repo.head.clone(),
          };
          let dir = repo
            .revs
            .get(&rev)
            .ok_or_else(|| Self::failure(input, "unknown revision"))?
            .clone();
          (rev, dir)
        };

        let tree = self.fetch_dir(&dir, input)?;
        let locked = Input {
          scheme: Scheme::Github(GithubInput {
            owner: github.owner.clone(),
            repo: github.repo.clone(),
            ref_: None,
            rev: Some(rev),
          }),
          nar_hash: tree.nar_hash,
          last_modified: Some(1733660000),
          rev_count: None,
        };
        Ok((tree, locked))
      }

      _ => Err(FetchError::UnsupportedInput { url: input.to_string() }),
    }
  }

  fn mark_changed_file(&self, _input: &Input, rel_path: &str, _commit_message: Option<&str>) -> Result<(), FetchError> {
    self.changed.borrow_mut().push(rel_path.to_string());
    Ok(())
  }
}

/// An evaluator over JSON manifests.
///
/// Objects carrying a `__formals` key evaluate to opaque function values.
/// The flake-calling glue expression is modeled as a curried function that
/// swallows its three arguments and returns `"called flake"`.
pub struct TestEval {
  next_handle: u64,
}

const GLUE_HANDLE: u64 = 9000;

impl TestEval {
  pub fn new() -> Self {
    TestEval { next_handle: 1 }
  }

  fn convert(&mut self, value: &serde_json::Value) -> Result<Value, EvalError> {
    Ok(match value {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(*b),
      serde_json::Value::Number(n) => Value::Int(
        n.as_i64()
          .ok_or_else(|| EvalError::new(format!("non-integer number {}", n)))?,
      ),
      serde_json::Value::String(s) => Value::String(s.clone()),
      serde_json::Value::Array(items) => Value::List(
        items
          .iter()
          .map(|item| self.convert(item))
          .collect::<Result<_, _>>()?,
      ),
      serde_json::Value::Object(fields) => {
        if let Some(formals) = fields.get("__formals") {
          let formals = formals
            .as_array()
            .ok_or_else(|| EvalError::new("__formals is not an array"))?
            .iter()
            .map(|f| {
              f.as_str()
                .map(str::to_string)
                .ok_or_else(|| EvalError::new("__formals entry is not a string"))
            })
            .collect::<Result<Vec<_>, _>>()?;
          let handle = self.next_handle;
          self.next_handle += 1;
          Value::Lambda(Lambda { formals, handle })
        } else {
          let mut attrs = BTreeMap::new();
          for (name, field) in fields {
            attrs.insert(name.clone(), self.convert(field)?);
          }
          Value::Attrs(attrs)
        }
      }
    })
  }
}

impl Evaluator for TestEval {
  fn eval_file(&mut self, path: &Path) -> Result<Value, EvalError> {
    let content =
      fs::read_to_string(path).map_err(|e| EvalError::new(format!("cannot read {}: {}", path.display(), e)))?;
    let json: serde_json::Value =
      serde_json::from_str(&content).map_err(|e| EvalError::new(format!("cannot parse {}: {}", path.display(), e)))?;
    self.convert(&json)
  }

  fn parse_expr(&mut self, _src: &str) -> Result<Value, EvalError> {
    Ok(Value::Lambda(Lambda {
      formals: Vec::new(),
      handle: GLUE_HANDLE,
    }))
  }

  fn call_function(&mut self, f: &Value, _arg: Value) -> Result<Value, EvalError> {
    match f {
      Value::Lambda(lambda) if (GLUE_HANDLE..GLUE_HANDLE + 2).contains(&lambda.handle) => Ok(Value::Lambda(Lambda {
        formals: Vec::new(),
        handle: lambda.handle + 1,
      })),
      Value::Lambda(lambda) if lambda.handle == GLUE_HANDLE + 2 => Ok(Value::string("called flake")),
      Value::Lambda(_) => Ok(Value::Null),
      other => Err(EvalError::new(format!("cannot call a {}", other.type_name()))),
    }
  }
}

/// Temp-directory world for one scenario.
pub struct Fixture {
  root: TempDir,
  pub store: LocalStore,
  pub fetcher: MockFetcher,
  pub registry: MemoryRegistry,
}

impl Fixture {
  pub fn new() -> Self {
    let root = TempDir::new().unwrap();
    let store = LocalStore::new(root.path().join("store"));
    let fetcher = MockFetcher::new(store.clone());
    Fixture {
      root,
      store,
      fetcher,
      registry: MemoryRegistry::new(),
    }
  }

  pub fn state<'a>(&'a self, eval: &'a mut TestEval) -> EvalState<'a> {
    EvalState::new(&self.store, &self.fetcher, &self.registry, eval)
  }

  /// Directory of a named source tree under the fixture root.
  pub fn flake_dir(&self, name: &str) -> PathBuf {
    self.root.path().join("src").join(name)
  }

  fn make_dir(&self, name: &str) -> PathBuf {
    let dir = self.flake_dir(name);
    fs::create_dir_all(&dir).unwrap();
    dir
  }

  /// Create a local source tree with the given manifest and return a
  /// writable path reference to it.
  pub fn top_flake(&mut self, name: &str, manifest: &str) -> FlakeRef {
    let dir = self.make_dir(name);
    fs::write(dir.join("flake.nix"), manifest).unwrap();
    FlakeRef::parse(&format!("path:{}", dir.display()), None, false).unwrap()
  }

  /// Register a github repository whose tree is a flake.
  pub fn add_github_flake(&mut self, owner: &str, repo: &str, rev: &str, manifest: &str) {
    let dir = self.make_dir(&format!("{}-{}-{}", owner, repo, rev));
    fs::write(dir.join("flake.nix"), manifest).unwrap();
    fs::write(dir.join("README.md"), rev).unwrap();
    self.fetcher.register_rev(&format!("github:{}/{}", owner, repo), rev, dir);
  }

  /// Register a github repository whose tree is not a flake (no manifest).
  pub fn add_github_repo(&mut self, owner: &str, repo: &str, rev: &str) {
    let dir = self.make_dir(&format!("{}-{}-{}", owner, repo, rev));
    fs::write(dir.join("README.md"), rev).unwrap();
    self.fetcher.register_rev(&format!("github:{}/{}", owner, repo), rev, dir);
  }

  /// Register an additional revision of an existing flake repository.
  pub fn add_rev_flake(&mut self, key: &str, rev: &str, manifest: &str) {
    let dir = self.make_dir(&format!("{}-{}", key.replace([':', '/'], "-"), rev));
    fs::write(dir.join("flake.nix"), manifest).unwrap();
    fs::write(dir.join("README.md"), rev).unwrap();
    self.fetcher.register_rev(key, rev, dir);
  }

  pub fn set_ref(&self, key: &str, name: &str, rev: &str) {
    self.fetcher.set_ref(key, name, rev);
  }

  pub fn set_head(&self, key: &str, rev: &str) {
    self.fetcher.set_head(key, rev);
  }
}
