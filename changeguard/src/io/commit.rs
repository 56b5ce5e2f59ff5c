//! Records a successful change in version-control history.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::{info, instrument, warn};

use crate::core::exclude::ExcludeRules;
use crate::core::types::{ChangeProposal, CommitRecord};
use crate::io::config::ChangeguardConfig;
use crate::io::git::Git;
use crate::io::tool::ToolRunner;

pub struct CommitRecorder<'a, R: ToolRunner> {
    git: Git<'a, R>,
    template: &'a str,
    /// Never staged: changeguard's own state and everything snapshots skip.
    excluded: ExcludeRules,
}

impl<'a, R: ToolRunner> CommitRecorder<'a, R> {
    pub fn new(runner: &'a R, workdir: &Path, cfg: &'a ChangeguardConfig) -> Self {
        Self {
            git: Git::from_config(runner, workdir, cfg),
            template: &cfg.commit.message_template,
            excluded: cfg.exclude_rules(workdir),
        }
    }

    /// Stage every non-excluded change and commit. Best effort: failures come back as
    /// [`CommitRecord::Failed`], never as an error.
    #[instrument(skip_all, fields(proposal_id = %proposal.id))]
    pub fn commit(&self, proposal: &ChangeProposal) -> CommitRecord {
        match self.try_commit(proposal) {
            Ok(record) => record,
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(%reason, "commit failed; change is applied but not recorded");
                CommitRecord::Failed { reason }
            }
        }
    }

    fn try_commit(&self, proposal: &ChangeProposal) -> Result<CommitRecord> {
        let message = render_message(self.template, proposal)?;
        self.git.add_all_except(&self.excluded)?;
        if !self.git.commit_staged(&message)? {
            info!("nothing to commit");
            return Ok(CommitRecord::NothingToCommit);
        }
        let sha = self.git.head_sha()?;
        info!(%sha, "change committed");
        Ok(CommitRecord::Committed { sha })
    }
}

pub fn render_message(template: &str, proposal: &ChangeProposal) -> Result<String> {
    let env = Environment::new();
    let tmpl = env
        .template_from_str(template)
        .context("parse commit message template")?;
    let rendered = tmpl
        .render(context! {
            id => proposal.id,
            title => proposal.title,
            target => proposal.target,
            difficulty => proposal.difficulty,
        })
        .context("render commit message template")?;
    Ok(rendered.trim_end().to_string())
}
