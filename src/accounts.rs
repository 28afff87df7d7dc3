//! Create users and groups inside a layer.
//!
//! These tasks parse the Debian-style account databases out of a layer
//! (`/etc/passwd`, `/etc/shadow`, `/etc/group`, `/etc/gshadow`), edit
//! the in-memory model and write both files back. Creation is
//! idempotent by name: asking for an account that already exists
//! returns the existing record and leaves the files untouched.

use std::io::{BufRead, Read};

use anyhow::{bail, Context, Result};
use fn_error_context::context;

use crate::source::BufferSource;
use crate::tree::{directory_header, file_header, LayerBuilder};

/// One `/etc/passwd` record joined with its `/etc/shadow` fields.
///
/// The password-aging columns are kept as raw strings; this code never
/// interprets them, only round-trips them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// The passwd password column, conventionally `x`.
    pub passwd: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
    /// The shadow password hash.
    pub password: String,
    pub last_change: String,
    pub min_age: String,
    pub max_age: String,
    pub warn_period: String,
    pub inactive: String,
    pub expires: String,
    pub reserved: String,
}

/// The parsed user database.
#[derive(Debug, Clone, Default)]
pub struct PasswdFile {
    users: Vec<User>,
}

impl PasswdFile {
    pub fn find_user(&self, name: &str) -> Option<&User> {
        self.users.iter().find(|u| u.name == name)
    }

    fn find_user_mut(&mut self, name: &str) -> Option<&mut User> {
        self.users.iter_mut().find(|u| u.name == name)
    }

    /// Lowest unused uid at or above the start of the range: 1000 for
    /// ordinary users, 100 for system users.
    pub fn assign_id(&self, system: bool) -> u32 {
        let start = if system { 100 } else { 1000 };
        next_free_id(start, self.users.iter().map(|u| u.uid))
    }

    pub fn add(&mut self, user: User) -> Result<()> {
        if self.find_user(&user.name).is_some() {
            bail!("duplicate user: {}", user.name);
        }
        self.users.push(user);
        Ok(())
    }

    /// Parse `/etc/passwd` (7 colon-separated fields per line).
    #[context("Parsing passwd")]
    pub fn parse_passwd(&mut self, r: impl BufRead) -> Result<()> {
        for line in r.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(':').collect();
            let [name, passwd, uid, gid, gecos, home, shell] = fields[..] else {
                bail!("malformed passwd line: {line}");
            };
            let uid = uid
                .parse()
                .with_context(|| format!("invalid uid in passwd line: {line}"))?;
            let gid = gid
                .parse()
                .with_context(|| format!("invalid gid in passwd line: {line}"))?;
            self.users.push(User {
                name: name.to_string(),
                passwd: passwd.to_string(),
                uid,
                gid,
                gecos: gecos.to_string(),
                home: home.to_string(),
                shell: shell.to_string(),
                ..Default::default()
            });
        }
        Ok(())
    }

    /// Parse `/etc/shadow` (9 fields), joining records to the users
    /// parsed from the primary file. A shadow entry without a matching
    /// user is a fatal error.
    #[context("Parsing shadow")]
    pub fn parse_shadow(&mut self, r: impl BufRead) -> Result<()> {
        for line in r.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(':').collect();
            let [name, password, last_change, min_age, max_age, warn_period, inactive, expires, reserved] =
                fields[..]
            else {
                bail!("malformed shadow line: {line}");
            };
            let Some(user) = self.find_user_mut(name) else {
                bail!("user in shadow not found in passwd: {name}");
            };
            user.password = password.to_string();
            user.last_change = last_change.to_string();
            user.min_age = min_age.to_string();
            user.max_age = max_age.to_string();
            user.warn_period = warn_period.to_string();
            user.inactive = inactive.to_string();
            user.expires = expires.to_string();
            user.reserved = reserved.to_string();
        }
        Ok(())
    }

    pub fn write_passwd(&self) -> String {
        let mut out = String::new();
        for u in &self.users {
            out.push_str(&format!(
                "{}:{}:{}:{}:{}:{}:{}\n",
                u.name, u.passwd, u.uid, u.gid, u.gecos, u.home, u.shell
            ));
        }
        out
    }

    pub fn write_shadow(&self) -> String {
        let mut out = String::new();
        for u in &self.users {
            out.push_str(&format!(
                "{}:{}:{}:{}:{}:{}:{}:{}:{}\n",
                u.name,
                u.password,
                u.last_change,
                u.min_age,
                u.max_age,
                u.warn_period,
                u.inactive,
                u.expires,
                u.reserved
            ));
        }
        out
    }
}

/// One `/etc/group` record joined with its `/etc/gshadow` fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    /// The group password column, conventionally `x`.
    pub passwd: String,
    pub gid: u32,
    /// The gshadow password, `!` for newly created groups.
    pub password: String,
    pub administrators: Vec<String>,
    pub members: Vec<String>,
}

/// The parsed group database.
#[derive(Debug, Clone, Default)]
pub struct GroupFile {
    groups: Vec<Group>,
}

impl GroupFile {
    pub fn find_group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn find_group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    /// Lowest unused gid at or above 100. Unlike uids, the start does
    /// not depend on whether the group is a system group; this matches
    /// the historical behavior of the tool this derives from.
    pub fn assign_id(&self) -> u32 {
        next_free_id(100, self.groups.iter().map(|g| g.gid))
    }

    pub fn add(&mut self, group: Group) -> Result<()> {
        if self.find_group(&group.name).is_some() {
            bail!("duplicate group: {}", group.name);
        }
        self.groups.push(group);
        Ok(())
    }

    /// Parse `/etc/group` (4 colon-separated fields per line).
    #[context("Parsing group")]
    pub fn parse_group(&mut self, r: impl BufRead) -> Result<()> {
        for line in r.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(':').collect();
            let [name, passwd, gid, members] = fields[..] else {
                bail!("malformed group line: {line}");
            };
            let gid = gid
                .parse()
                .with_context(|| format!("invalid gid in group line: {line}"))?;
            self.groups.push(Group {
                name: name.to_string(),
                passwd: passwd.to_string(),
                gid,
                members: split_names(members),
                ..Default::default()
            });
        }
        Ok(())
    }

    /// Parse `/etc/gshadow` (4 fields), joining records by name. The
    /// member list is carried by the primary file.
    #[context("Parsing gshadow")]
    pub fn parse_gshadow(&mut self, r: impl BufRead) -> Result<()> {
        for line in r.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(':').collect();
            let [name, password, administrators, _members] = fields[..] else {
                bail!("malformed gshadow line: {line}");
            };
            let Some(group) = self.find_group_mut(name) else {
                bail!("group in gshadow not found in group: {name}");
            };
            group.password = password.to_string();
            group.administrators = split_names(administrators);
        }
        Ok(())
    }

    pub fn write_group(&self) -> String {
        let mut out = String::new();
        for g in &self.groups {
            out.push_str(&format!(
                "{}:{}:{}:{}\n",
                g.name,
                g.passwd,
                g.gid,
                g.members.join(",")
            ));
        }
        out
    }

    pub fn write_gshadow(&self) -> String {
        let mut out = String::new();
        for g in &self.groups {
            out.push_str(&format!(
                "{}:{}:{}:{}\n",
                g.name,
                g.password,
                g.administrators.join(","),
                g.members.join(",")
            ));
        }
        out
    }
}

fn split_names(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
        .collect()
}

fn next_free_id(start: u32, used: impl Iterator<Item = u32>) -> u32 {
    let used: std::collections::BTreeSet<u32> = used.collect();
    let mut id = start;
    while used.contains(&id) {
        id += 1;
    }
    id
}

fn read_db_file(layer: &LayerBuilder, path: &[&str]) -> Result<Option<String>> {
    if !layer.exists(path) {
        return Ok(None);
    }
    let mut contents = String::new();
    layer
        .open(path)?
        .read_to_string(&mut contents)
        .with_context(|| format!("Reading /{}", path.join("/")))?;
    Ok(Some(contents))
}

fn write_db_file(layer: &mut LayerBuilder, path: &[&str], contents: String, mode: u32) -> Result<()> {
    let name = format!("/{}", path.join("/"));
    let header = file_header(mode, contents.len() as u64);
    let source = BufferSource::from_vec(contents.into_bytes(), name);
    layer.add_entry(path, Some(Box::new(source)), &header, true)
}

/// Create a group in the layer's account databases.
#[derive(Debug, Clone, Default)]
pub struct CreateGroup {
    pub name: String,
    /// Explicit gid; assigned from the free range when absent.
    pub gid: Option<u32>,
    pub system: bool,
}

impl CreateGroup {
    /// Run the task, returning the created (or pre-existing) group.
    #[context("Creating group {}", self.name)]
    pub fn run(&self, layer: &mut LayerBuilder) -> Result<Group> {
        layer.mkdirp(&["etc"], &directory_header(0o755))?;

        let mut groups = GroupFile::default();
        if let Some(contents) = read_db_file(layer, &["etc", "group"])? {
            groups.parse_group(contents.as_bytes())?;
        }
        if let Some(contents) = read_db_file(layer, &["etc", "gshadow"])? {
            groups.parse_gshadow(contents.as_bytes())?;
        }

        if let Some(existing) = groups.find_group(&self.name) {
            return Ok(existing.clone());
        }

        let group = Group {
            name: self.name.clone(),
            passwd: "x".to_string(),
            gid: self.gid.unwrap_or_else(|| groups.assign_id()),
            password: "!".to_string(),
            administrators: Vec::new(),
            members: Vec::new(),
        };
        groups.add(group.clone())?;

        write_db_file(layer, &["etc", "group"], groups.write_group(), 0o644)?;
        write_db_file(layer, &["etc", "gshadow"], groups.write_gshadow(), 0o600)?;
        Ok(group)
    }
}

/// Create a user in the layer's account databases.
#[derive(Debug, Clone, Default)]
pub struct CreateUser {
    pub name: String,
    /// Explicit uid; assigned from the free range when absent.
    pub uid: Option<u32>,
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
    /// Shadow password hash; defaults to `*` (no password login).
    pub password: Option<String>,
    pub system: bool,
    /// Accepted for interface compatibility; creating the home
    /// directory is a separate ingest step.
    pub create_home: bool,
}

impl CreateUser {
    /// Run the task, returning the created (or pre-existing) user.
    #[context("Creating user {}", self.name)]
    pub fn run(&self, layer: &mut LayerBuilder) -> Result<User> {
        layer.mkdirp(&["etc"], &directory_header(0o755))?;

        let mut users = PasswdFile::default();
        if let Some(contents) = read_db_file(layer, &["etc", "passwd"])? {
            users.parse_passwd(contents.as_bytes())?;
        }
        if let Some(contents) = read_db_file(layer, &["etc", "shadow"])? {
            users.parse_shadow(contents.as_bytes())?;
        }

        if let Some(existing) = users.find_user(&self.name) {
            return Ok(existing.clone());
        }

        let user = User {
            name: self.name.clone(),
            passwd: "x".to_string(),
            uid: self.uid.unwrap_or_else(|| users.assign_id(self.system)),
            gid: self.gid,
            gecos: self.gecos.clone(),
            home: self.home.clone(),
            shell: self.shell.clone(),
            password: self.password.clone().unwrap_or_else(|| "*".to_string()),
            ..Default::default()
        };
        users.add(user.clone())?;

        write_db_file(layer, &["etc", "passwd"], users.write_passwd(), 0o644)?;
        write_db_file(layer, &["etc", "shadow"], users.write_shadow(), 0o600)?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const PASSWD: &str = indoc! {"
        root:x:0:0:root:/root:/bin/bash
        daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
    "};
    const SHADOW: &str = indoc! {"
        root:*:16176:0:99999:7:::
        daemon:*:16176:0:99999:7:::
    "};
    const GROUP: &str = indoc! {"
        root:x:0:
        adm:x:4:syslog
    "};
    const GSHADOW: &str = indoc! {"
        root:*::
        adm:*::syslog
    "};

    #[test]
    fn passwd_round_trips() -> Result<()> {
        let mut db = PasswdFile::default();
        db.parse_passwd(PASSWD.as_bytes())?;
        db.parse_shadow(SHADOW.as_bytes())?;
        assert_eq!(db.write_passwd(), PASSWD);
        assert_eq!(db.write_shadow(), SHADOW);
        let root = db.find_user("root").unwrap();
        assert_eq!((root.uid, root.gid), (0, 0));
        assert_eq!(root.password, "*");
        Ok(())
    }

    #[test]
    fn group_round_trips() -> Result<()> {
        let mut db = GroupFile::default();
        db.parse_group(GROUP.as_bytes())?;
        db.parse_gshadow(GSHADOW.as_bytes())?;
        assert_eq!(db.write_group(), GROUP);
        assert_eq!(db.write_gshadow(), GSHADOW);
        assert_eq!(db.find_group("adm").unwrap().members, vec!["syslog"]);
        Ok(())
    }

    #[test]
    fn blank_lines_are_skipped() -> Result<()> {
        let mut db = GroupFile::default();
        db.parse_group("root:x:0:\n\nadm:x:4:\n".as_bytes())?;
        assert_eq!(db.write_group(), "root:x:0:\nadm:x:4:\n");
        Ok(())
    }

    #[test]
    fn malformed_lines_fail() {
        let mut db = PasswdFile::default();
        let err = db.parse_passwd("root:x:0:0:root\n".as_bytes()).err().unwrap();
        assert!(format!("{err:#}").contains("malformed passwd line"));

        let mut db = GroupFile::default();
        let err = db.parse_group("root:x:zero:\n".as_bytes()).err().unwrap();
        assert!(format!("{err:#}").contains("invalid gid"));
    }

    #[test]
    fn shadow_entry_without_user_fails() {
        let mut db = PasswdFile::default();
        db.parse_passwd(PASSWD.as_bytes()).unwrap();
        let err = db
            .parse_shadow("ghost:*:16176:0:99999:7:::\n".as_bytes())
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("user in shadow not found"));
    }

    fn layer_with_groups() -> Result<LayerBuilder> {
        let mut layer = LayerBuilder::new("test");
        layer.mkdirp(&["etc"], &directory_header(0o755))?;
        write_db_file(&mut layer, &["etc", "group"], "root:x:0:\n".into(), 0o644)?;
        write_db_file(&mut layer, &["etc", "gshadow"], "root:*::\n".into(), 0o600)?;
        Ok(layer)
    }

    fn read_file(layer: &LayerBuilder, path: &[&str]) -> String {
        read_db_file(layer, path).unwrap().unwrap()
    }

    #[test]
    fn create_group_assigns_first_free_system_id() -> Result<()> {
        let mut layer = layer_with_groups()?;
        let group = CreateGroup {
            name: "memcache".to_string(),
            system: true,
            ..Default::default()
        }
        .run(&mut layer)?;
        assert_eq!(group.gid, 100);
        assert_eq!(read_file(&layer, &["etc", "group"]), "root:x:0:\nmemcache:x:100:\n");
        assert_eq!(
            read_file(&layer, &["etc", "gshadow"]),
            "root:*::\nmemcache:!::\n"
        );
        Ok(())
    }

    #[test]
    fn group_id_range_ignores_system_flag() -> Result<()> {
        // Historical quirk: non-system groups also allocate from 100.
        let mut layer = layer_with_groups()?;
        let first = CreateGroup {
            name: "app".to_string(),
            ..Default::default()
        }
        .run(&mut layer)?;
        assert_eq!(first.gid, 100);
        let second = CreateGroup {
            name: "web".to_string(),
            ..Default::default()
        }
        .run(&mut layer)?;
        assert_eq!(second.gid, 101);
        Ok(())
    }

    #[test]
    fn create_group_is_idempotent() -> Result<()> {
        let mut layer = layer_with_groups()?;
        let req = CreateGroup {
            name: "memcache".to_string(),
            system: true,
            ..Default::default()
        };
        let first = req.run(&mut layer)?;
        let before = read_file(&layer, &["etc", "group"]);
        let again = req.run(&mut layer)?;
        assert_eq!(first, again);
        assert_eq!(read_file(&layer, &["etc", "group"]), before);
        Ok(())
    }

    #[test]
    fn create_user_in_fresh_layer() -> Result<()> {
        let mut layer = LayerBuilder::new("test");
        let group = CreateGroup {
            name: "memcache".to_string(),
            system: true,
            ..Default::default()
        }
        .run(&mut layer)?;
        let user = CreateUser {
            name: "memcache".to_string(),
            gid: group.gid,
            gecos: "Memcached".to_string(),
            shell: "/bin/false".to_string(),
            system: true,
            ..Default::default()
        }
        .run(&mut layer)?;
        assert_eq!(user.uid, 100);
        assert_eq!(user.password, "*");
        assert_eq!(
            read_file(&layer, &["etc", "passwd"]),
            "memcache:x:100:100:Memcached::/bin/false\n"
        );
        assert_eq!(read_file(&layer, &["etc", "shadow"]), "memcache:*:::::::\n");
        Ok(())
    }

    #[test]
    fn user_ids_start_at_1000_unless_system() -> Result<()> {
        let mut layer = LayerBuilder::new("test");
        layer.mkdirp(&["etc"], &directory_header(0o755))?;
        write_db_file(&mut layer, &["etc", "passwd"], PASSWD.to_string(), 0o644)?;
        let user = CreateUser {
            name: "app".to_string(),
            gid: 100,
            ..Default::default()
        }
        .run(&mut layer)?;
        assert_eq!(user.uid, 1000);
        Ok(())
    }
}
