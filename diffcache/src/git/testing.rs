//! Throwaway repositories for tests.

use git2::{IndexEntry, IndexTime, Oid, Repository, Signature};

pub struct TestRepo {
    _dir: tempfile::TempDir,
    path: String,
    repo: Repository,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        let path = dir.path().to_string_lossy().into_owned();
        TestRepo { _dir: dir, path, repo }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Commits a full snapshot of regular files on top of `parents`.
    pub fn commit(&self, files: &[(&str, &str)], parents: &[&str]) -> String {
        let entries: Vec<_> =
            files.iter().map(|(path, text)| (*path, text.as_bytes(), 0o100644)).collect();
        self.commit_entries(&entries, parents)
    }

    /// Commits a snapshot with explicit modes (symlinks, executables).
    pub fn commit_entries(&self, entries: &[(&str, &[u8], u32)], parents: &[&str]) -> String {
        let mut index = git2::Index::new().unwrap();
        for (path, content, mode) in entries {
            let id = self.repo.blob(content).unwrap();
            index
                .add(&IndexEntry {
                    ctime: IndexTime::new(0, 0),
                    mtime: IndexTime::new(0, 0),
                    dev: 0,
                    ino: 0,
                    mode: *mode,
                    uid: 0,
                    gid: 0,
                    file_size: content.len() as u32,
                    id,
                    flags: 0,
                    flags_extended: 0,
                    path: path.as_bytes().to_vec(),
                })
                .unwrap();
        }
        let tree = self.repo.find_tree(index.write_tree_to(&self.repo).unwrap()).unwrap();
        let parents: Vec<_> = parents
            .iter()
            .map(|sha1| self.repo.find_commit(Oid::from_str(sha1).unwrap()).unwrap())
            .collect();
        let parent_refs: Vec<_> = parents.iter().collect();
        let sig = Signature::new("Test", "test@example.com", &git2::Time::new(1_700_000_000, 0))
            .unwrap();
        let message = format!("commit {}", entries.len());
        self.repo
            .commit(None, &sig, &sig, &message, &tree, &parent_refs)
            .unwrap()
            .to_string()
    }
}
