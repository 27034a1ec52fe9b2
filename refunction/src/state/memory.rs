use std::{
    fmt,
    fs::{self, File, OpenOptions},
    ops::Range,
    os::unix::fs::FileExt,
    thread,
};

use refunction_common::{
    anyhow::{anyhow, Context, Result},
    nix::unistd::{sysconf, Pid, SysconfVar},
    procfs::process::{MMPermissions, MMapPath, MemoryMap, Process},
    tracing::{debug, trace},
};

pub const HEAP: &str = "[heap]";
pub const STACK: &str = "[stack]";

/// Upper bound of concurrent pagemap readers per region.
const SHARDS: usize = 8;
/// Regions smaller than this many pages per shard are not split further.
const MIN_SHARD_PAGES: usize = 16;
const PAGEMAP_ENTRY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub shared: bool,
}

impl From<MMPermissions> for Permissions {
    fn from(perms: MMPermissions) -> Self {
        Self {
            readable: perms.contains(MMPermissions::READ),
            writable: perms.contains(MMPermissions::WRITE),
            executable: perms.contains(MMPermissions::EXECUTE),
            shared: perms.contains(MMPermissions::SHARED),
        }
    }
}

/// One line of `/proc/<pid>/maps`, plus its bytes once captured.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub perms: Permissions,
    pub dev: (i32, i32),
    pub inode: u64,
    pub content: Option<Vec<u8>>,
}

impl MemoryRegion {
    fn from_map(map: MemoryMap) -> Option<Self> {
        let name = match map.pathname {
            MMapPath::Vvar | MMapPath::Vdso | MMapPath::Vsyscall => return None,
            MMapPath::Path(path) => path.display().to_string(),
            MMapPath::Heap => HEAP.to_string(),
            MMapPath::Stack => STACK.to_string(),
            MMapPath::TStack(tid) => format!("[stack:{tid}]"),
            MMapPath::Anonymous => String::new(),
            MMapPath::Other(name) => name,
            other => format!("{other:?}"),
        };

        Some(Self {
            name,
            start: map.address.0,
            end: map.address.1,
            offset: map.offset,
            perms: map.perms.into(),
            dev: map.dev,
            inode: map.inode,
            content: None,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    /// Compares everything but the captured bytes.
    pub fn same_location(&self, other: &MemoryRegion) -> bool {
        self.name == other.name
            && self.start == other.start
            && self.end == other.end
            && self.offset == other.offset
            && self.perms == other.perms
            && self.dev == other.dev
            && self.inode == other.inode
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("name", &self.name)
            .field("range", &format_args!("{:#x}-{:#x}", self.start, self.end))
            .field("perms", &self.perms)
            .field("content", &self.content.as_ref().map(Vec::len))
            .finish()
    }
}

/// Enumerates the regions of `pid`, leaving out kernel owned mappings.
pub(crate) fn read_regions(pid: Pid) -> Result<Vec<MemoryRegion>> {
    let proc = Process::new(pid.as_raw()).with_context(|| format!("could not open process {pid}"))?;
    let maps = proc
        .maps()
        .with_context(|| format!("could not read memory maps of {pid}"))?;

    Ok(maps.into_iter().filter_map(MemoryRegion::from_map).collect())
}

pub(crate) fn page_size() -> Result<usize> {
    let size = sysconf(SysconfVar::PAGE_SIZE)
        .context("could not query page size")?
        .ok_or_else(|| anyhow!("page size is not defined"))?;
    Ok(size as usize)
}

fn proc_file(pid: Pid, name: &str) -> String {
    format!("/proc/{pid}/{name}")
}

/// Reads the bytes of every writable region through `/proc/<pid>/mem`.
pub(crate) fn save_writable_pages(pid: Pid, regions: &mut [MemoryRegion]) -> Result<()> {
    let mem = File::open(proc_file(pid, "mem")).context("could not open process memory")?;

    for region in regions.iter_mut().filter(|r| r.perms.writable) {
        let mut buf = vec![0u8; region.len() as usize];
        mem.read_exact_at(&mut buf, region.start)
            .with_context(|| format!("could not read {region:?}"))?;
        region.content = Some(buf);
    }

    Ok(())
}

/// Resets the soft-dirty bits of every page of `pid`.
pub(crate) fn clear_soft_dirty(pid: Pid) -> Result<()> {
    fs::write(proc_file(pid, "clear_refs"), "4")
        .with_context(|| format!("could not clear soft-dirty bits of {pid}"))
}

/// Bit 55 of a little-endian pagemap entry.
pub(crate) fn is_soft_dirty(entry: &[u8]) -> bool {
    entry[6] >> 7 & 1 == 1
}

/// Splits `num_pages` into at most `shards` contiguous ranges.
pub(crate) fn shard_ranges(num_pages: usize, shards: usize) -> Vec<Range<usize>> {
    let shards = (num_pages / MIN_SHARD_PAGES).clamp(1, shards.max(1));
    let per_shard = num_pages.div_ceil(shards);

    (0..shards)
        .map(|i| (i * per_shard).min(num_pages)..((i + 1) * per_shard).min(num_pages))
        .filter(|r| !r.is_empty())
        .collect()
}

/// The parts of `range` not covered by any of `taken`.
pub(crate) fn subtract_ranges(range: Range<u64>, taken: &[Range<u64>]) -> Vec<Range<u64>> {
    let mut left = vec![range];
    for cut in taken {
        left = left
            .into_iter()
            .flat_map(|r| {
                if cut.end <= r.start || cut.start >= r.end {
                    return vec![r];
                }
                [r.start..cut.start, cut.end..r.end]
                    .into_iter()
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .collect();
    }
    left
}

fn read_pagemap(pagemap: &File, start: u64, pages: Range<usize>, page_size: usize) -> Result<Vec<u8>> {
    let mut entries = vec![0u8; pages.len() * PAGEMAP_ENTRY];
    let first = start / page_size as u64 + pages.start as u64;
    pagemap
        .read_exact_at(&mut entries, first * PAGEMAP_ENTRY as u64)
        .with_context(|| format!("could not read pagemap at {:#x}", start + (pages.start * page_size) as u64))?;
    Ok(entries)
}

/// Counts the soft-dirty pages of `region` in the live process.
pub(crate) fn count_dirty_pages(pid: Pid, region: &MemoryRegion) -> Result<usize> {
    let page_size = page_size()?;
    let pagemap = File::open(proc_file(pid, "pagemap")).context("could not open pagemap")?;
    let pages = region.len() as usize / page_size;

    let entries = read_pagemap(&pagemap, region.start, 0..pages, page_size)?;
    Ok(entries
        .chunks_exact(PAGEMAP_ENTRY)
        .filter(|e| is_soft_dirty(e))
        .count())
}

/// Writes the captured content of every soft-dirty page back into `pid`.
///
/// Regions are restored concurrently and large regions are split into shards,
/// each with its own pagemap descriptor. Returns the number of pages written.
pub(crate) fn restore_dirty_pages(pid: Pid, regions: &[MemoryRegion]) -> Result<usize> {
    let page_size = page_size()?;
    let mem = OpenOptions::new()
        .read(true)
        .write(true)
        .open(proc_file(pid, "mem"))
        .context("could not open process memory")?;
    let pagemap_path = proc_file(pid, "pagemap");
    let (mem, pagemap_path) = (&mem, pagemap_path.as_str());

    let results: Vec<Result<usize>> = thread::scope(|s| {
        let handles: Vec<_> = regions
            .iter()
            .filter_map(|region| region.content.as_deref().map(|content| (region, content)))
            .map(|(region, content)| {
                s.spawn(move || {
                    thread::scope(|s| {
                        let shards: Vec<_> = shard_ranges(content.len() / page_size, SHARDS)
                            .into_iter()
                            .map(|pages| {
                                s.spawn(move || {
                                    restore_shard(mem, pagemap_path, region, content, pages, page_size)
                                })
                            })
                            .collect();
                        join_all(shards)
                    })
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("page restore thread panicked"))))
            .collect()
    });

    let mut restored = 0;
    let mut errors = vec![];
    for result in results {
        match result {
            Ok(pages) => restored += pages,
            Err(e) => errors.push(e),
        }
    }

    if let Some(first) = errors.into_iter().next() {
        return Err(first.context(format!("could not restore dirty pages of {pid}")));
    }
    debug!("restored {restored} dirty pages of {pid}");
    Ok(restored)
}

fn join_all(shards: Vec<thread::ScopedJoinHandle<'_, Result<usize>>>) -> Result<usize> {
    let mut total = 0;
    for shard in shards {
        total += shard
            .join()
            .unwrap_or_else(|_| Err(anyhow!("page restore shard panicked")))?;
    }
    Ok(total)
}

fn restore_shard(
    mem: &File,
    pagemap_path: &str,
    region: &MemoryRegion,
    content: &[u8],
    pages: Range<usize>,
    page_size: usize,
) -> Result<usize> {
    let pagemap = File::open(pagemap_path).context("could not open pagemap")?;
    let entries = read_pagemap(&pagemap, region.start, pages.clone(), page_size)?;

    let mut restored = 0;
    for (page, entry) in pages.zip(entries.chunks_exact(PAGEMAP_ENTRY)) {
        if !is_soft_dirty(entry) {
            continue;
        }
        let offset = page * page_size;
        let addr = region.start + offset as u64;
        mem.write_all_at(&content[offset..offset + page_size], addr)
            .with_context(|| format!("could not write page {addr:#x} of {}", region.name))?;
        restored += 1;
    }

    if restored > 0 {
        trace!(
            region = %region.name,
            "restored {restored} of {} pages",
            content.len() / page_size
        );
    }
    Ok(restored)
}
