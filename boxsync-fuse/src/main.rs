#[cfg(not(feature = "fuse-mount"))]
fn main() {
    eprintln!("boxsync-fuse binary requires --features fuse-mount");
    std::process::exit(1);
}

#[cfg(feature = "fuse-mount")]
mod app {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use boxsyncd::daemon::{DaemonConfig, DaemonRuntime};
    use boxsyncd::sync::metadata::EntryKind;
    use boxsyncd::sync::model::{Model, ModelError, NodeAttr};
    use boxsyncd::sync::paths;
    use fuser::{
        FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
        ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
        Request, TimeOrNow,
    };
    use libc::{EIO, ENOENT, ENOTEMPTY, ERANGE};
    use tokio::runtime::Runtime;

    const TTL: Duration = Duration::from_secs(1);

    struct InodeMap {
        next: u64,
        path_to_ino: HashMap<String, u64>,
        ino_to_path: HashMap<u64, String>,
    }

    impl InodeMap {
        fn new() -> Self {
            let mut path_to_ino = HashMap::new();
            let mut ino_to_path = HashMap::new();
            path_to_ino.insert("/".to_string(), 1);
            ino_to_path.insert(1, "/".to_string());
            Self {
                next: 2,
                path_to_ino,
                ino_to_path,
            }
        }

        fn inode_for(&mut self, path: &str) -> u64 {
            if let Some(existing) = self.path_to_ino.get(path) {
                return *existing;
            }
            let ino = self.next;
            self.next += 1;
            self.path_to_ino.insert(path.to_string(), ino);
            self.ino_to_path.insert(ino, path.to_string());
            ino
        }

        fn path_for(&self, ino: u64) -> Option<String> {
            self.ino_to_path.get(&ino).cloned()
        }

        /// Follows a rename: every mapping at or under `from` moves to the
        /// corresponding path under `to`, keeping its inode number.
        fn rename_prefix(&mut self, from: &str, to: &str) {
            let affected: Vec<(String, u64)> = self
                .path_to_ino
                .iter()
                .filter(|(path, _)| *path == from || paths::is_descendant_of(path, from))
                .map(|(path, ino)| (path.clone(), *ino))
                .collect();
            for (old_path, ino) in affected {
                let new_path = if old_path == from {
                    to.to_string()
                } else {
                    format!("{to}{}", &old_path[from.len()..])
                };
                self.path_to_ino.remove(&old_path);
                self.path_to_ino.insert(new_path.clone(), ino);
                self.ino_to_path.insert(ino, new_path);
            }
        }

        fn forget(&mut self, path: &str) {
            if let Some(ino) = self.path_to_ino.remove(path) {
                self.ino_to_path.remove(&ino);
            }
        }
    }

    struct BoxsyncFuseFs {
        rt: Runtime,
        model: Arc<Model>,
        inodes: Mutex<InodeMap>,
    }

    impl BoxsyncFuseFs {
        fn new(rt: Runtime, model: Arc<Model>) -> Self {
            Self {
                rt,
                model,
                inodes: Mutex::new(InodeMap::new()),
            }
        }

        fn path_from_ino(&self, ino: u64) -> Option<String> {
            self.inodes.lock().ok()?.path_for(ino)
        }

        fn inode_for(&self, path: &str) -> u64 {
            match self.inodes.lock() {
                Ok(mut inodes) => inodes.inode_for(path),
                Err(_) => 0,
            }
        }

        fn node_attr(&self, path: &str) -> Result<FileAttr, ModelError> {
            let attr = self.rt.block_on(self.model.getattr(path))?;
            Ok(file_attr(self.inode_for(path), &attr))
        }

        fn cache_path_of(&self, ino: u64) -> Option<PathBuf> {
            let path = self.path_from_ino(ino)?;
            self.model.cache_path(&path).ok()
        }
    }

    fn errno_for(err: &ModelError) -> i32 {
        match err {
            ModelError::NotFound(_) => ENOENT,
            ModelError::NotEmpty(_) => ENOTEMPTY,
            ModelError::Io(io) => io.raw_os_error().unwrap_or(EIO),
            _ => EIO,
        }
    }

    fn to_fuse_kind(kind: EntryKind) -> FileType {
        match kind {
            EntryKind::Folder => FileType::Directory,
            EntryKind::File => FileType::RegularFile,
        }
    }

    fn unix_to_system_time(ts: i64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64)
    }

    fn file_attr(ino: u64, attr: &NodeAttr) -> FileAttr {
        let kind = to_fuse_kind(attr.kind);
        let mtime = unix_to_system_time(attr.modified);
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: if matches!(kind, FileType::Directory) {
                0o755
            } else {
                0o644
            },
            nlink: if matches!(kind, FileType::Directory) {
                2
            } else {
                1
            },
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
            rdev: 0,
            flags: 0,
            blksize: 512,
        }
    }

    impl Filesystem for BoxsyncFuseFs {
        fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = paths::child_path(&parent_path, &name.to_string_lossy());
            match self.node_attr(&path) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.node_attr(&path) {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn setattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
            size: Option<u64>,
            _atime: Option<TimeOrNow>,
            _mtime: Option<TimeOrNow>,
            _ctime: Option<SystemTime>,
            _fh: Option<u64>,
            _crtime: Option<SystemTime>,
            _chgtime: Option<SystemTime>,
            _bkuptime: Option<SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            if let Some(size) = size {
                if let Err(err) = self.rt.block_on(self.model.truncate(&path, size)) {
                    reply.error(errno_for(&err));
                    return;
                }
            }
            match self.node_attr(&path) {
                Ok(attr) => reply.attr(&TTL, &attr),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            let children = match self.rt.block_on(self.model.readdir(&path)) {
                Ok(children) => children,
                Err(err) => {
                    reply.error(errno_for(&err));
                    return;
                }
            };

            let mut entries: Vec<(u64, FileType, String)> = Vec::new();
            entries.push((ino, FileType::Directory, ".".to_string()));
            let parent_ino = self.inode_for(&paths::parent_of(&path));
            entries.push((parent_ino, FileType::Directory, "..".to_string()));
            for (name, kind) in children {
                let child_ino = self.inode_for(&paths::child_path(&path, &name));
                entries.push((child_ino, to_fuse_kind(kind), name));
            }

            for (idx, (entry_ino, entry_type, name)) in
                entries.iter().enumerate().skip(offset as usize)
            {
                let next = (idx + 1) as i64;
                if reply.add(*entry_ino, next, *entry_type, name) {
                    break;
                }
            }
            reply.ok();
        }

        fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.rt.block_on(self.model.open(&path)) {
                Ok(()) => reply.opened(0, 0),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn read(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self
                .rt
                .block_on(self.model.read(&path, offset.max(0) as u64, size))
            {
                Ok(data) => reply.data(&data),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn write(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            let Some(path) = self.path_from_ino(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self
                .rt
                .block_on(self.model.write(&path, offset.max(0) as u64, data))
            {
                Ok(written) => reply.written(written),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn create(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            _flags: i32,
            reply: ReplyCreate,
        ) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = paths::child_path(&parent_path, &name.to_string_lossy());
            if let Err(err) = self.rt.block_on(self.model.create(&path)) {
                reply.error(errno_for(&err));
                return;
            }
            match self.node_attr(&path) {
                Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn mkdir(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = paths::child_path(&parent_path, &name.to_string_lossy());
            if let Err(err) = self.rt.block_on(self.model.mkdir(&path)) {
                reply.error(errno_for(&err));
                return;
            }
            match self.node_attr(&path) {
                Ok(attr) => reply.entry(&TTL, &attr, 0),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = paths::child_path(&parent_path, &name.to_string_lossy());
            match self.rt.block_on(self.model.rmdir(&path)) {
                Ok(()) => {
                    if let Ok(mut inodes) = self.inodes.lock() {
                        inodes.forget(&path);
                    }
                    reply.ok();
                }
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(parent_path) = self.path_from_ino(parent) else {
                reply.error(ENOENT);
                return;
            };
            let path = paths::child_path(&parent_path, &name.to_string_lossy());
            match self.rt.block_on(self.model.unlink(&path)) {
                Ok(()) => {
                    if let Ok(mut inodes) = self.inodes.lock() {
                        inodes.forget(&path);
                    }
                    reply.ok();
                }
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn rename(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            _flags: u32,
            reply: ReplyEmpty,
        ) {
            let (Some(parent_path), Some(newparent_path)) =
                (self.path_from_ino(parent), self.path_from_ino(newparent))
            else {
                reply.error(ENOENT);
                return;
            };
            let from = paths::child_path(&parent_path, &name.to_string_lossy());
            let to = paths::child_path(&newparent_path, &newname.to_string_lossy());
            match self.rt.block_on(self.model.rename(&from, &to)) {
                Ok(()) => {
                    if let Ok(mut inodes) = self.inodes.lock() {
                        inodes.rename_prefix(&from, &to);
                    }
                    reply.ok();
                }
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn flush(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            _fh: u64,
            _lock_owner: u64,
            reply: ReplyEmpty,
        ) {
            // Writes already queued their upload; nothing extra to push here.
            reply.ok();
        }

        fn release(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            _fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            reply.ok();
        }

        fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
            match self.rt.block_on(self.model.statfs()) {
                Ok(stats) => reply.statfs(
                    stats.blocks,
                    stats.bfree,
                    stats.bavail,
                    stats.files,
                    // Entries are not inode-bounded; report plenty of room.
                    1_000_000,
                    stats.bsize,
                    255,
                    stats.bsize,
                ),
                Err(err) => reply.error(errno_for(&err)),
            }
        }

        fn getxattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            size: u32,
            reply: ReplyXattr,
        ) {
            let Some(cache) = self.cache_path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            match xattr::get(&cache, name) {
                Ok(Some(value)) => {
                    if size == 0 {
                        reply.size(value.len() as u32);
                    } else if value.len() <= size as usize {
                        reply.data(&value);
                    } else {
                        reply.error(ERANGE);
                    }
                }
                Ok(None) => reply.error(libc::ENODATA),
                Err(err) => reply.error(err.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn setxattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            name: &OsStr,
            value: &[u8],
            _flags: i32,
            _position: u32,
            reply: ReplyEmpty,
        ) {
            let Some(cache) = self.cache_path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            match xattr::set(&cache, name, value) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
            let Some(cache) = self.cache_path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            match xattr::list(&cache) {
                Ok(names) => {
                    let mut out: Vec<u8> = Vec::new();
                    for name in names {
                        out.extend_from_slice(name.to_string_lossy().as_bytes());
                        out.push(0);
                    }
                    if size == 0 {
                        reply.size(out.len() as u32);
                    } else if out.len() <= size as usize {
                        reply.data(&out);
                    } else {
                        reply.error(ERANGE);
                    }
                }
                Err(err) => reply.error(err.raw_os_error().unwrap_or(EIO)),
            }
        }

        fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(cache) = self.cache_path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            match xattr::remove(&cache, name) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.raw_os_error().unwrap_or(EIO)),
            }
        }
    }

    pub fn run() -> anyhow::Result<()> {
        dotenvy::dotenv().ok();
        let mountpoint = parse_mountpoint()?;
        std::fs::create_dir_all(&mountpoint)?;

        let rt = Runtime::new()?;
        let config = DaemonConfig::from_env()?;
        let (ctx, _workers) = rt.block_on(async {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            let workers = daemon.spawn_workers();
            let ctx = Arc::clone(daemon.context());
            Ok::<_, anyhow::Error>((ctx, workers))
        })?;
        let model = Arc::new(Model::new(Arc::clone(&ctx)));

        eprintln!("[boxsync-fuse] mounting at {}", mountpoint.display());
        let fs = BoxsyncFuseFs::new(rt, model);
        let options = vec![
            MountOption::FSName("boxsync-fuse".to_string()),
            MountOption::DefaultPermissions,
        ];
        let mount_result = fuser::mount2(fs, &mountpoint, &options);
        ctx.request_stop();
        mount_result?;
        Ok(())
    }

    fn parse_mountpoint() -> anyhow::Result<PathBuf> {
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "--mount" {
                if let Some(path) = args.next() {
                    return Ok(PathBuf::from(path));
                }
            }
        }
        anyhow::bail!("usage: boxsync-fuse --mount <path>")
    }
}

#[cfg(feature = "fuse-mount")]
fn main() -> anyhow::Result<()> {
    app::run()
}
