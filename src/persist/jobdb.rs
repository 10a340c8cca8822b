use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::scheduler::job::Job;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id   TEXT PRIMARY KEY,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS job_order (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id  TEXT NOT NULL UNIQUE REFERENCES jobs(id) ON DELETE CASCADE
);
";

/// Job records in SQLite, plus the order in which the stack holds them.
///
/// Bodies are stored as JSON so the record shape can grow without
/// migrations.
pub struct JobDb {
    conn: Mutex<Connection>,
}

impl JobDb {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new job at the end of the order. Fails if the id exists.
    pub fn add(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO jobs (id, body) VALUES (?1, ?2)",
            params![job.id.to_string(), serde_json::to_string(job)?],
        )?;
        tx.execute(
            "INSERT INTO job_order (id) VALUES (?1)",
            params![job.id.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<Job>> {
        let body: Option<String> = self
            .conn()
            .query_row(
                "SELECT body FROM jobs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|b| serde_json::from_str(&b).map_err(QueueError::from))
            .transpose()
    }

    /// Every job, in stack order.
    pub fn all(&self) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT j.body FROM job_order o JOIN jobs j ON j.id = o.id ORDER BY o.seq",
        )?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        bodies
            .iter()
            .map(|b| serde_json::from_str(b).map_err(QueueError::from))
            .collect()
    }

    /// Overwrite an existing job.
    pub fn update(&self, job: &Job) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE jobs SET body = ?2 WHERE id = ?1",
            params![job.id.to_string(), serde_json::to_string(job)?],
        )?;
        if changed == 0 {
            return Err(QueueError::JobNotFound(job.id));
        }
        Ok(())
    }

    /// Insert or overwrite; new jobs go to the end of the order.
    pub fn put(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        upsert(&tx, job)?;
        tx.commit()?;
        Ok(())
    }

    /// Returns whether a record was deleted.
    pub fn delete(&self, id: &Uuid) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id.to_string()])?;
        Ok(changed > 0)
    }

    /// Move the named jobs to the front, in the given order. Unknown ids
    /// are ignored and unnamed jobs keep their relative order behind them.
    pub fn reorder(&self, front: &[Uuid]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        reorder_in(&tx, front)?;
        tx.commit()?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Make the store hold exactly what `jobs` holds, in the same order.
    /// Unchanged bodies and an unchanged order are left alone.
    pub fn sync(&self, jobs: &[Job]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for job in jobs {
            upsert(&tx, job)?;
        }

        let keep: HashSet<String> = jobs.iter().map(|j| j.id.to_string()).collect();
        let stored = ordered_ids(&tx)?;
        for id in stored.iter().filter(|id| !keep.contains(*id)) {
            tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        }

        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        reorder_in(&tx, &ids)?;
        tx.commit()?;
        Ok(())
    }
}

fn upsert(tx: &Transaction<'_>, job: &Job) -> Result<()> {
    let id = job.id.to_string();
    tx.execute(
        "INSERT INTO jobs (id, body) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET body = excluded.body
         WHERE body <> excluded.body",
        params![id, serde_json::to_string(job)?],
    )?;
    tx.execute(
        "INSERT OR IGNORE INTO job_order (id) VALUES (?1)",
        params![id],
    )?;
    Ok(())
}

fn ordered_ids(tx: &Transaction<'_>) -> Result<Vec<String>> {
    let mut stmt = tx.prepare("SELECT id FROM job_order ORDER BY seq")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn reorder_in(tx: &Transaction<'_>, front: &[Uuid]) -> Result<()> {
    let current = ordered_ids(tx)?;
    let known: HashSet<&str> = current.iter().map(String::as_str).collect();
    let mut placed: HashSet<String> = HashSet::with_capacity(current.len());
    let mut next: Vec<String> = Vec::with_capacity(current.len());
    for id in front.iter().map(Uuid::to_string) {
        if known.contains(id.as_str()) && placed.insert(id.clone()) {
            next.push(id);
        }
    }
    for id in &current {
        if placed.insert(id.clone()) {
            next.push(id.clone());
        }
    }

    if next == current {
        return Ok(());
    }
    tx.execute("DELETE FROM job_order", [])?;
    for id in &next {
        tx.execute("INSERT INTO job_order (id) VALUES (?1)", params![id])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::scheduler::job::JobStatus;

    fn job(name: &str) -> Job {
        Job::new(Uuid::new_v4(), name, "tester", BTreeMap::new())
    }

    fn names(db: &JobDb) -> Vec<String> {
        db.all().unwrap().into_iter().map(|j| j.name).collect()
    }

    #[test]
    fn add_get_update_delete() {
        let db = JobDb::open_in_memory().unwrap();
        let mut j = job("a");
        db.add(&j).unwrap();
        assert!(db.add(&j).is_err());
        assert_eq!(db.get(&j.id).unwrap(), Some(j.clone()));

        j.status = JobStatus::Done;
        db.update(&j).unwrap();
        assert_eq!(db.get(&j.id).unwrap().unwrap().status, JobStatus::Done);

        assert!(db.delete(&j.id).unwrap());
        assert!(!db.delete(&j.id).unwrap());
        assert!(db.get(&j.id).unwrap().is_none());
        assert!(matches!(db.update(&j), Err(QueueError::JobNotFound(_))));
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn reorder_moves_named_jobs_to_front() {
        let db = JobDb::open_in_memory().unwrap();
        let (a, b, c, d) = (job("a"), job("b"), job("c"), job("d"));
        for j in [&a, &b, &c, &d] {
            db.add(j).unwrap();
        }

        db.reorder(&[c.id, Uuid::new_v4(), a.id]).unwrap();
        assert_eq!(names(&db), ["c", "a", "b", "d"]);

        db.delete(&a.id).unwrap();
        assert_eq!(names(&db), ["c", "b", "d"]);
    }

    #[test]
    fn sync_mirrors_contents_and_order() {
        let db = JobDb::open_in_memory().unwrap();
        let (a, b, c) = (job("a"), job("b"), job("c"));
        db.add(&a).unwrap();
        db.add(&b).unwrap();

        let mut b2 = b.clone();
        b2.progress = 50.0;
        db.sync(&[c.clone(), b2.clone()]).unwrap();

        assert_eq!(names(&db), ["c", "b"]);
        assert_eq!(db.get(&b.id).unwrap().unwrap().progress, 50.0);
        assert!(db.get(&a.id).unwrap().is_none());
    }

    #[test]
    fn repeated_sync_leaves_order_rows_alone() {
        let db = JobDb::open_in_memory().unwrap();
        let jobs = vec![job("a"), job("b"), job("c")];
        db.sync(&jobs).unwrap();

        let max_seq = |db: &JobDb| -> i64 {
            db.conn()
                .query_row("SELECT MAX(seq) FROM job_order", [], |row| row.get(0))
                .unwrap()
        };
        let before = max_seq(&db);
        db.sync(&jobs).unwrap();
        assert_eq!(max_seq(&db), before);
        assert_eq!(names(&db), ["a", "b", "c"]);

        db.sync(&[jobs[2].clone(), jobs[0].clone(), jobs[1].clone()]).unwrap();
        assert_eq!(names(&db), ["c", "a", "b"]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let j = job("persisted");
        {
            let db = JobDb::open(&path).unwrap();
            db.add(&j).unwrap();
        }
        let db = JobDb::open(&path).unwrap();
        assert_eq!(db.all().unwrap(), vec![j]);
    }
}
