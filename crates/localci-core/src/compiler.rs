//! Pipeline compiler: include resolution, `extends` merging, rule and
//! variable resolution, predefined-variable assembly.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::git::GitInfo;
use crate::job::{Artifacts, Cache, CacheKey, Image, Job, RESERVED_NAMES};
use crate::pipeline_config::{PipelineConfig, DEFAULT_STAGES};
use crate::process::spawn;
use crate::rules::{evaluate_rules, Rule, When};
use crate::validation::ValidationError;
use crate::variables::Scope;

#[derive(Debug, Error)]
pub enum CompileErrorKind {
    #[error("failed to read pipeline file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse pipeline YAML in {path}: {source}")]
    Parse { path: PathBuf, source: serde_yaml::Error },
    #[error("include cycle detected: {0}")]
    IncludeCycle(String),
    #[error("failed to fetch remote include `{0}`: {1}")]
    RemoteFetch(String, String),
    #[error("failed to fetch project include {project}@{r#ref}:{file}: {reason}")]
    ProjectFetch { project: String, r#ref: String, file: String, reason: String },
    #[error("unknown template include `{0}`")]
    UnknownTemplate(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("rule expression error in job `{job}`: {message}")]
    RuleExpression { job: String, message: String },
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct CompileError(#[from] pub CompileErrorKind);

// --- raw YAML shape ----------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
struct RawRoot {
    stages: Option<Vec<String>>,
    #[serde(default)]
    variables: HashMap<String, String>,
    include: Option<IncludeSpec>,
    default: Option<RawJob>,
    #[serde(flatten)]
    jobs: HashMap<String, RawJob>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IncludeSpec {
    One(IncludeEntry),
    Many(Vec<IncludeEntry>),
}

impl IncludeSpec {
    fn into_vec(self) -> Vec<IncludeEntry> {
        match self {
            IncludeSpec::One(e) => vec![e],
            IncludeSpec::Many(es) => es,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum IncludeEntry {
    Bare(String),
    Local { local: String },
    Remote { remote: String },
    Project {
        project: String,
        #[serde(rename = "ref")]
        ref_: Option<String>,
        file: String,
    },
    Template { template: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExtendsSpec {
    One(String),
    Many(Vec<String>),
}

impl ExtendsSpec {
    fn into_vec(self) -> Vec<String> {
        match self {
            ExtendsSpec::One(s) => vec![s],
            ExtendsSpec::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawRule {
    r#if: Option<String>,
    when: Option<String>,
    #[serde(default)]
    allow_failure: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawCache {
    key: Option<serde_yaml::Value>,
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawArtifacts {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct RawJob {
    stage: Option<String>,
    image: Option<serde_yaml::Value>,
    extends: Option<ExtendsSpec>,
    script: Option<OneOrMany>,
    before_script: Option<OneOrMany>,
    after_script: Option<OneOrMany>,
    needs: Option<Vec<serde_yaml::Value>>,
    rules: Option<Vec<RawRule>>,
    #[serde(default)]
    variables: HashMap<String, String>,
    artifacts: Option<RawArtifacts>,
    cache: Option<RawCache>,
    #[serde(default)]
    interactive: bool,
    #[serde(default)]
    inject_ssh_agent: bool,
    coverage: Option<String>,
    when: Option<String>,
    #[serde(default)]
    allow_failure: bool,
}

impl RawJob {
    /// Shallow field-by-field merge: `other` overrides `self` wherever it
    /// sets a field, matching the document's "later wins" merge rule for
    /// both includes and `extends` chains.
    fn merge_over(mut self, other: RawJob) -> RawJob {
        macro_rules! over {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field;
                }
            };
        }
        over!(stage);
        over!(image);
        over!(extends);
        over!(script);
        over!(before_script);
        over!(after_script);
        over!(needs);
        over!(rules);
        over!(artifacts);
        over!(cache);
        over!(coverage);
        over!(when);

        self.variables.extend(other.variables);
        if other.interactive {
            self.interactive = true;
        }
        if other.inject_ssh_agent {
            self.inject_ssh_agent = true;
        }
        if other.allow_failure {
            self.allow_failure = true;
        }
        self
    }
}

fn parse_when(s: &str) -> When {
    match s {
        "always" => When::Always,
        "manual" => When::Manual,
        "never" => When::Never,
        _ => When::OnSuccess,
    }
}

fn parse_image(value: &serde_yaml::Value) -> Option<Image> {
    match value {
        serde_yaml::Value::String(s) => Some(Image::new(s.clone())),
        serde_yaml::Value::Mapping(m) => {
            let name = m.get(serde_yaml::Value::String("name".into()))?.as_str()?.to_string();
            let mut image = Image::new(name);
            if let Some(serde_yaml::Value::Sequence(seq)) =
                m.get(serde_yaml::Value::String("entrypoint".into()))
            {
                image.entrypoint = Some(
                    seq.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                );
            }
            Some(image)
        }
        _ => None,
    }
}

fn parse_cache_key(value: &serde_yaml::Value) -> Option<CacheKey> {
    match value {
        serde_yaml::Value::String(s) => Some(CacheKey::Literal(s.clone())),
        serde_yaml::Value::Mapping(m) => {
            if let Some(serde_yaml::Value::Sequence(seq)) =
                m.get(serde_yaml::Value::String("files".into()))
            {
                return Some(CacheKey::Files {
                    files: seq.iter().filter_map(|v| v.as_str().map(str::to_string)).collect(),
                });
            }
            None
        }
        _ => None,
    }
}

fn needs_name(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Mapping(m) => m
            .get(serde_yaml::Value::String("job".into()))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

/// Injected dependency for `include: remote` / `include: project`, so the
/// compiler's fixed-point resolution can be exercised in tests without a
/// live network or git remote.
pub trait IncludeFetcher {
    fn fetch_remote(&self, url: &str) -> Result<String, CompileError>;
    fn fetch_project_file(&self, project: &str, r#ref: &str, file: &str) -> Result<String, CompileError>;
}

/// Default fetcher: `curl` for remote URLs, `git archive` for project refs,
/// both run through the same process spawner used everywhere else, with
/// results cached under `.gitlab-ci-local/includes/`.
pub struct ProcessFetcher {
    pub cache_dir: PathBuf,
}

impl IncludeFetcher for ProcessFetcher {
    fn fetch_remote(&self, url: &str) -> Result<String, CompileError> {
        let host = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or("unknown-host");
        let cache_path = self.cache_dir.join(host).join(url.rsplit('/').next().unwrap_or("include.yml"));

        if let Ok(cached) = fs::read_to_string(&cache_path) {
            return Ok(cached);
        }

        let cwd = std::env::current_dir().unwrap_or_default();
        let cmd = format!("curl -fsSL {url}");
        let output = spawn(&cmd, &cwd, &Default::default())
            .map_err(|e| CompileErrorKind::RemoteFetch(url.to_string(), e.to_string()))?;

        if let Some(parent) = cache_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(&cache_path, &output.stdout);
        Ok(output.stdout)
    }

    fn fetch_project_file(&self, project: &str, r#ref: &str, file: &str) -> Result<String, CompileError> {
        let cache_path = self.cache_dir.join(project).join(r#ref).join(file);
        if let Ok(cached) = fs::read_to_string(&cache_path) {
            return Ok(cached);
        }

        let cwd = std::env::current_dir().unwrap_or_default();
        let cmd = format!("git archive --remote={project} {ref_} {file} | tar -xO", ref_ = r#ref, file = file);
        let output = spawn(&cmd, &cwd, &Default::default()).map_err(|e| CompileErrorKind::ProjectFetch {
            project: project.to_string(),
            r#ref: r#ref.to_string(),
            file: file.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = cache_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(&cache_path, &output.stdout);
        Ok(output.stdout)
    }
}

/// A minimal template library, standing in for GitLab's shipped
/// `Jobs/*.gitlab-ci.yml` templates; looked up by name.
pub struct TemplateLibrary(BTreeMap<String, String>);

impl TemplateLibrary {
    #[must_use]
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.0.insert(name.into(), contents.into());
        self
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

pub struct Compiler<'a> {
    root_dir: PathBuf,
    fetcher: &'a dyn IncludeFetcher,
    templates: &'a TemplateLibrary,
}

impl<'a> Compiler<'a> {
    #[must_use]
    pub fn new(root_dir: PathBuf, fetcher: &'a dyn IncludeFetcher, templates: &'a TemplateLibrary) -> Self {
        Self { root_dir, fetcher, templates }
    }

    /// Loads and compiles `entry_file` (relative to `root_dir`) into a
    /// [`PipelineConfig`], threading git-derived predefined variables
    /// through every job's scope.
    pub fn compile(&self, entry_file: &Path, git: &GitInfo, pipeline_iid: u64) -> Result<PipelineConfig, CompileError> {
        let mut visited = HashSet::new();
        let merged = self.load_and_merge(entry_file, &mut visited)?;

        let stages = merged.stages.clone().unwrap_or_else(|| {
            DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()
        });

        let mut global_scope = Scope::new();
        for (k, v) in &merged.variables {
            global_scope.insert(k.clone(), v.clone());
        }
        let predefined = predefined_variables(git, pipeline_iid);
        let global_scope = Scope::compose([predefined, global_scope]);

        let mut config = PipelineConfig::new(stages, global_scope.clone());

        let resolved_jobs = resolve_extends(&merged.jobs)?;

        for (name, mut raw) in resolved_jobs {
            if name.starts_with('.') || RESERVED_NAMES.contains(&name.as_str()) {
                continue;
            }
            if let Some(default) = &merged.default {
                raw = default.clone().merge_over(raw);
            }

            let job_scope_raw = {
                let mut s = Scope::new();
                for (k, v) in &raw.variables {
                    s.insert(k.clone(), v.clone());
                }
                s
            };
            let job_scope = Scope::compose([global_scope.clone(), job_scope_raw]);
            let expanded_vars = crate::variables::expand_variables(&job_scope, &job_scope);

            let rules: Vec<Rule> = raw
                .rules
                .clone()
                .unwrap_or_default()
                .into_iter()
                .map(|r| Rule {
                    condition: r.r#if,
                    when: r.when.as_deref().map(parse_when).unwrap_or(When::OnSuccess),
                    allow_failure: r.allow_failure,
                })
                .collect();

            let (when, allow_failure) = if rules.is_empty() {
                (
                    raw.when.as_deref().map(parse_when).unwrap_or(When::OnSuccess),
                    raw.allow_failure,
                )
            } else {
                let outcome = evaluate_rules(&rules, &job_scope).map_err(|e| CompileErrorKind::RuleExpression {
                    job: name.clone(),
                    message: e.to_string(),
                })?;
                (outcome.when, outcome.allow_failure)
            };

            let needs = raw
                .needs
                .as_ref()
                .map(|list| list.iter().filter_map(needs_name).collect::<Vec<_>>());

            let job = Job {
                name: name.clone(),
                stage: raw.stage.unwrap_or_else(|| "test".to_string()),
                image: raw.image.as_ref().and_then(parse_image),
                before_scripts: raw.before_script.map(OneOrMany::into_vec).unwrap_or_default(),
                scripts: raw.script.map(OneOrMany::into_vec).unwrap_or_default(),
                after_scripts: raw.after_script.map(OneOrMany::into_vec).unwrap_or_default(),
                needs,
                variables: expanded_vars,
                artifacts: Artifacts { paths: raw.artifacts.map(|a| a.paths).unwrap_or_default() },
                cache: Cache {
                    key: raw.cache.as_ref().and_then(|c| c.key.as_ref()).and_then(parse_cache_key),
                    paths: raw.cache.map(|c| c.paths).unwrap_or_default(),
                },
                interactive: raw.interactive,
                inject_ssh_agent: raw.inject_ssh_agent,
                coverage: raw.coverage,
                when,
                allow_failure,
            };

            config.jobs.insert(name, job);
        }

        config.validate()?;
        Ok(config)
    }

    fn load_and_merge(&self, file: &Path, visited: &mut HashSet<PathBuf>) -> Result<RawRoot, CompileError> {
        let full_path = self.root_dir.join(file);
        let canonical = full_path.canonicalize().unwrap_or(full_path.clone());
        if !visited.insert(canonical.clone()) {
            return Err(CompileErrorKind::IncludeCycle(full_path.display().to_string()).into());
        }

        let text = fs::read_to_string(&full_path).map_err(|source| CompileErrorKind::Read {
            path: full_path.clone(),
            source,
        })?;
        let mut root: RawRoot = serde_yaml::from_str(&text).map_err(|source| CompileErrorKind::Parse {
            path: full_path.clone(),
            source,
        })?;

        let includes = root.include.take().map(IncludeSpec::into_vec).unwrap_or_default();
        let mut merged = RawRoot::default();

        for entry in includes {
            let included = self.resolve_include(&entry, visited)?;
            merged = merge_roots(merged, included);
        }

        merged = merge_roots(merged, root);
        visited.remove(&canonical);
        Ok(merged)
    }

    fn resolve_include(&self, entry: &IncludeEntry, visited: &mut HashSet<PathBuf>) -> Result<RawRoot, CompileError> {
        match entry {
            IncludeEntry::Bare(path) | IncludeEntry::Local { local: path } => {
                self.load_and_merge(Path::new(path), visited)
            }
            IncludeEntry::Remote { remote } => {
                let text = self.fetcher.fetch_remote(remote)?;
                parse_inline(&text)
            }
            IncludeEntry::Project { project, ref_, file } => {
                let r#ref = ref_.clone().unwrap_or_else(|| "HEAD".to_string());
                let text = self.fetcher.fetch_project_file(project, &r#ref, file)?;
                parse_inline(&text)
            }
            IncludeEntry::Template { template } => {
                let text = self
                    .templates
                    .get(template)
                    .ok_or_else(|| CompileErrorKind::UnknownTemplate(template.clone()))?;
                parse_inline(text)
            }
        }
    }
}

fn parse_inline(text: &str) -> Result<RawRoot, CompileError> {
    serde_yaml::from_str(text).map_err(|source| {
        CompileErrorKind::Parse { path: PathBuf::from("<include>"), source }.into()
    })
}

fn merge_roots(base: RawRoot, other: RawRoot) -> RawRoot {
    let mut merged = base;
    if other.stages.is_some() {
        merged.stages = other.stages;
    }
    merged.variables.extend(other.variables);
    if other.default.is_some() {
        merged.default = other.default;
    }
    for (name, job) in other.jobs {
        merged
            .jobs
            .entry(name)
            .and_modify(|existing| *existing = existing.clone().merge_over(job.clone()))
            .or_insert(job);
    }
    merged
}

/// Resolves `extends:` chains; a derived job's own fields override its
/// base's, and a list of bases is folded left to right (later wins).
fn resolve_extends(jobs: &HashMap<String, RawJob>) -> Result<HashMap<String, RawJob>, CompileError> {
    fn resolve_one<'a>(
        name: &str,
        jobs: &'a HashMap<String, RawJob>,
        cache: &mut HashMap<String, RawJob>,
        stack: &mut HashSet<String>,
    ) -> Result<RawJob, CompileError> {
        if let Some(cached) = cache.get(name) {
            return Ok(cached.clone());
        }
        if !stack.insert(name.to_string()) {
            return Err(CompileErrorKind::IncludeCycle(format!("extends cycle at `{name}`")).into());
        }

        let raw = jobs
            .get(name)
            .ok_or_else(|| ValidationError::WithPath {
                path: "extends".into(),
                error: Box::new(ValidationError::InvalidStep {
                    reason: format!("unknown job `{name}` in extends chain"),
                }),
            })?
            .clone();

        let resolved = match &raw.extends {
            None => raw.clone(),
            Some(spec) => {
                let mut base = RawJob::default();
                for parent in spec.clone().into_vec() {
                    let parent_resolved = resolve_one(&parent, jobs, cache, stack)?;
                    base = base.merge_over(parent_resolved);
                }
                base.merge_over(raw.clone())
            }
        };

        stack.remove(name);
        cache.insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    let mut cache = HashMap::new();
    let mut out = HashMap::new();
    for name in jobs.keys() {
        let mut stack = HashSet::new();
        out.insert(name.clone(), resolve_one(name, jobs, &mut cache, &mut stack)?);
    }
    Ok(out)
}

/// Builds the `CI_*` scope derived purely from git metadata and job
/// identity — independent of anything the pipeline file itself declares.
#[must_use]
pub fn predefined_variables(git: &GitInfo, pipeline_iid: u64) -> Scope {
    let mut s = Scope::new();
    s.insert("CI_PIPELINE_IID", pipeline_iid.to_string());
    s.insert("CI_PIPELINE_ID", (pipeline_iid + 1000).to_string());
    s.insert("CI_PIPELINE_SOURCE", "push");
    s.insert("CI_COMMIT_SHA", &git.commit_sha);
    s.insert("CI_COMMIT_SHORT_SHA", &git.commit_short_sha);
    s.insert("CI_COMMIT_BRANCH", &git.branch);
    s.insert("CI_COMMIT_REF_NAME", &git.branch);
    s.insert("CI_COMMIT_REF_SLUG", slugify(&git.branch));
    s.insert("CI_COMMIT_REF_PROTECTED", "false");
    s.insert("CI_COMMIT_TITLE", &git.commit_title);
    s.insert("CI_COMMIT_MESSAGE", &git.commit_message);
    s.insert("CI_COMMIT_DESCRIPTION", &git.commit_message);
    s.insert("GITLAB_USER_LOGIN", &git.user_name);
    s.insert("GITLAB_USER_EMAIL", &git.user_email);
    s.insert("GITLAB_USER_NAME", &git.user_name);
    s.insert("GITLAB_CI", "false");
    s.insert("CI_PROJECT_VISIBILITY", "internal");
    s.insert("CI_PROJECT_ID", "1217");

    if let Some(remote) = &git.remote {
        s.insert("CI_SERVER_HOST", &remote.domain);
        s.insert("CI_SERVER_URL", format!("https://{}", remote.domain));
        s.insert("CI_API_V4_URL", format!("https://{}/api/v4", remote.domain));
        s.insert("CI_PROJECT_NAME", &remote.project);
        s.insert("CI_PROJECT_TITLE", title_case(&remote.project));
        s.insert("CI_PROJECT_NAMESPACE", &remote.group);
        s.insert("CI_PROJECT_PATH", format!("{}/{}", remote.group, remote.project));
        s.insert(
            "CI_PROJECT_PATH_SLUG",
            slugify(&format!("{}/{}", remote.group, remote.project)),
        );
        s.insert(
            "CI_PROJECT_URL",
            format!("https://{}/{}/{}", remote.domain, remote.group, remote.project),
        );
    }

    s
}

fn slugify(input: &str) -> String {
    let mut out: String = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    out.truncate(63);
    out.trim_matches('-').to_string()
}

fn title_case(input: &str) -> String {
    input
        .split(['-', '_'])
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
