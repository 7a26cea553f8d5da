//! Index writer: chunks repository documents and upserts them in batches.

use std::path::{Path, PathBuf};

use crate::{
    chunking::chunk_markdown,
    error::{Error, Result},
    store::{VectorStore, collection_name},
    walker::{self, DiscoveredFile},
};

/// Largest number of sections sent to the store in one upsert.
pub const MAX_BATCH_SIZE: usize = 128;

/// Split `items` into consecutive groups of at most `size` elements.
///
/// # Examples
///
/// ```
/// use ask_the_code::index::batches;
///
/// let groups: Vec<_> = batches(&[1, 2, 3, 4, 5], 2).collect();
/// assert_eq!(groups, vec![&[1, 2][..], &[3, 4], &[5]]);
/// ```
pub fn batches<T>(items: &[T], size: usize) -> std::slice::Chunks<'_, T> {
    items.chunks(size.max(1))
}

/// Progress marker emitted once per indexed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    /// Repository-relative path with `/` separators.
    pub path: String,
    /// Number of sections upserted for the file.
    pub sections: usize,
}

/// Writes the documents of one repository into its collection.
#[derive(Debug)]
pub struct Indexer<'a, S: VectorStore> {
    store: &'a S,
    root: PathBuf,
    collection: String,
    glob: String,
}

impl<'a, S: VectorStore> Indexer<'a, S> {
    pub fn new(store: &'a S, root: &Path, glob: &str) -> Self {
        Self {
            store,
            root: root.to_path_buf(),
            collection: collection_name(root),
            glob: glob.to_string(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Drop the collection (if any) and create it empty.
    pub fn reset_index(&self) -> Result<()> {
        tracing::info!(collection = %self.collection, "resetting collection");
        self.store.delete_collection(&self.collection)?;
        self.store.create_collection(&self.collection)
    }

    /// Chunk one file and upsert its sections, returning how many were
    /// written. Relative paths are resolved against the repository root.
    pub fn add_document(&self, path: &Path) -> Result<usize> {
        if !self.store.has_collection(&self.collection)? {
            return Err(Error::collection_not_found(&self.collection));
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let relative = absolute.strip_prefix(&self.root).unwrap_or(&absolute);
        let source = walker::relative_source(relative);

        let content = std::fs::read_to_string(&absolute)?;

        let mut ids = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut documents = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut written = 0;

        for section in chunk_markdown(&source, &content) {
            ids.push(section.id);
            documents.push(section.text);

            if ids.len() == MAX_BATCH_SIZE {
                written += self.flush(&mut ids, &mut documents)?;
            }
        }
        if !ids.is_empty() {
            written += self.flush(&mut ids, &mut documents)?;
        }

        tracing::debug!(path = %source, sections = written, "indexed document");
        Ok(written)
    }

    fn flush(
        &self,
        ids: &mut Vec<String>,
        documents: &mut Vec<String>,
    ) -> Result<usize> {
        self.store.upsert(&self.collection, ids, documents)?;
        let count = ids.len();
        tracing::debug!(collection = %self.collection, count, "upserted batch");
        ids.clear();
        documents.clear();
        Ok(count)
    }

    /// Rebuild the collection from every matching file in the repository.
    ///
    /// The collection is reset and the files are listed up front; each file
    /// is then chunked and upserted only when the returned iterator is
    /// advanced. The first failure ends the sequence.
    pub fn create(&self) -> Result<IndexProgress<'_, 'a, S>> {
        self.reset_index()?;
        let files = walker::discover_files(&self.root, &self.glob)?;

        Ok(IndexProgress {
            indexer: self,
            total: files.len(),
            files: files.into_iter(),
            failed: false,
        })
    }
}

/// Lazy per-file progress of [`Indexer::create`].
#[derive(Debug)]
pub struct IndexProgress<'i, 'a, S: VectorStore> {
    indexer: &'i Indexer<'a, S>,
    files: std::vec::IntoIter<DiscoveredFile>,
    total: usize,
    failed: bool,
}

impl<S: VectorStore> IndexProgress<'_, '_, S> {
    /// Number of files discovered for this run.
    pub fn total(&self) -> usize {
        self.total
    }
}

impl<S: VectorStore> Iterator for IndexProgress<'_, '_, S> {
    type Item = Result<IndexedFile>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let file = self.files.next()?;

        // Relative, so it resolves against the configured root even when the
        // walker saw it through a canonicalized (symlink-free) one.
        match self.indexer.add_document(&file.relative_path) {
            Ok(sections) => Some(Ok(IndexedFile {
                path: walker::relative_source(&file.relative_path),
                sections,
            })),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            (0, Some(0))
        } else {
            (0, Some(self.files.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, testing::RecordingStore};

    struct Repo {
        _tmp: tempfile::TempDir,
        path: PathBuf,
    }

    impl Repo {
        fn path(&self) -> &Path {
            &self.path
        }
    }

    fn repo() -> Repo {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("test_repo");
        std::fs::create_dir_all(path.join(".git")).unwrap();
        Repo { _tmp: tmp, path }
    }

    #[test]
    fn batches_split_evenly_with_remainder() {
        let groups: Vec<_> = batches(&[1, 2, 3, 4, 5], 2).collect();
        assert_eq!(groups, vec![&[1, 2][..], &[3, 4], &[5]]);
    }

    #[test]
    fn create_indexes_single_readme() {
        let repo = repo();
        std::fs::write(repo.path().join("README.md"), "# Setup\n\nRun install.")
            .unwrap();

        let store = RecordingStore::default();
        let indexer = Indexer::new(&store, repo.path(), "**/*.md");
        let progress: Vec<_> = indexer
            .create()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        assert_eq!(
            progress,
            vec![IndexedFile {
                path: "README.md".to_string(),
                sections: 1,
            }]
        );
        assert_eq!(
            *store.upserts.borrow(),
            vec![(
                vec!["README.md#setup".to_string()],
                vec!["Run install.".to_string()],
            )]
        );
    }

    #[test]
    fn upserts_in_batches_of_max_size() {
        let repo = repo();
        let content: String = (0..300)
            .map(|i| format!("# Heading {i}\n\nbody {i}\n\n"))
            .collect();
        std::fs::write(repo.path().join("big.md"), content).unwrap();

        let store = RecordingStore::with_collection(&collection_name(repo.path()));
        let indexer = Indexer::new(&store, repo.path(), "**/*.md");
        let written = indexer.add_document(Path::new("big.md")).unwrap();

        assert_eq!(written, 300);
        let upserts = store.upserts.borrow();
        assert_eq!(upserts.len(), 300usize.div_ceil(MAX_BATCH_SIZE));
        let sizes: Vec<_> = upserts.iter().map(|(ids, _)| ids.len()).collect();
        assert_eq!(sizes, vec![128, 128, 44]);

        for (ids, documents) in upserts.iter() {
            assert_eq!(ids.len(), documents.len());
        }
        // Pairing survives the batch boundary.
        assert_eq!(upserts[1].0[0], "big.md#heading-128");
        assert_eq!(upserts[1].1[0], "body 128");
    }

    #[test]
    fn repeated_heading_overwrites_earlier_section() {
        let repo = repo();
        std::fs::write(repo.path().join("a.md"), "# FAQ\n\none\n\n# FAQ\n\ntwo\n")
            .unwrap();

        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(store_dir.path()).unwrap();
        let indexer = Indexer::new(&store, repo.path(), "**/*.md");
        let progress: Vec<_> = indexer
            .create()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();

        // Both sections are written; the store keeps the later one.
        assert_eq!(progress[0].sections, 2);
        assert_eq!(store.count(indexer.collection()).unwrap(), 1);
        let hits = store.query(indexer.collection(), "faq", 10).unwrap();
        assert_eq!(hits.ids, vec![vec!["a.md#faq".to_string()]]);
        assert_eq!(hits.documents, vec![vec!["two".to_string()]]);
    }

    #[test]
    fn add_document_without_collection_fails() {
        let repo = repo();
        std::fs::write(repo.path().join("README.md"), "# Setup\n").unwrap();

        let store = RecordingStore::default();
        let indexer = Indexer::new(&store, repo.path(), "**/*.md");
        let err = indexer.add_document(Path::new("README.md")).unwrap_err();

        assert!(matches!(
            err,
            Error::CollectionNotFound { ref name } if name == "docs-test_repo"
        ));
        assert!(store.upserts.borrow().is_empty());
    }

    #[test]
    fn reset_index_deletes_then_creates_once() {
        let repo = repo();
        let store = RecordingStore::default();
        let indexer = Indexer::new(&store, repo.path(), "**/*.md");

        indexer.reset_index().unwrap();

        assert_eq!(*store.deletes.borrow(), 1);
        assert_eq!(*store.creates.borrow(), 1);
        assert!(store.has_collection("docs-test_repo").unwrap());
    }

    #[test]
    fn create_skips_ignored_and_unmatched_files() {
        let repo = repo();
        std::fs::write(repo.path().join(".gitignore"), "drafts/\n").unwrap();
        std::fs::create_dir(repo.path().join("drafts")).unwrap();
        std::fs::write(repo.path().join("drafts/wip.md"), "# WIP\n").unwrap();
        std::fs::write(repo.path().join("notes.txt"), "plain").unwrap();
        std::fs::write(repo.path().join("guide.md"), "# Guide\n\ntext\n")
            .unwrap();

        let store = RecordingStore::default();
        let indexer = Indexer::new(&store, repo.path(), "**/*.md");
        let progress = indexer.create().unwrap();
        assert_eq!(progress.total(), 1);

        let paths: Vec<_> = progress.map(|p| p.unwrap().path).collect();
        assert_eq!(paths, vec!["guide.md"]);
    }

    #[test]
    fn progress_is_lazy() {
        let repo = repo();
        std::fs::write(repo.path().join("a.md"), "# A\n").unwrap();
        std::fs::write(repo.path().join("b.md"), "# B\n").unwrap();

        let store = RecordingStore::default();
        let indexer = Indexer::new(&store, repo.path(), "**/*.md");
        let mut progress = indexer.create().unwrap();

        assert!(store.upserts.borrow().is_empty());
        progress.next().unwrap().unwrap();
        assert_eq!(store.upserts.borrow().len(), 1);
    }

    #[test]
    fn create_stops_after_first_failure() {
        let repo = repo();
        std::fs::write(repo.path().join("a.md"), "# A\n").unwrap();
        std::fs::write(repo.path().join("b.md"), "# B\n").unwrap();

        let store = RecordingStore::default();
        let indexer = Indexer::new(&store, repo.path(), "**/*.md");
        let mut progress = indexer.create().unwrap();

        // Collection vanishes underneath the run.
        store.delete_collection(indexer.collection()).unwrap();

        assert!(matches!(
            progress.next(),
            Some(Err(Error::CollectionNotFound { .. }))
        ));
        assert!(progress.next().is_none());
    }
}
