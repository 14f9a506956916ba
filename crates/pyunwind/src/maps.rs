/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead};
use std::path::PathBuf;

use log::trace;

use crate::unwind::process::ProcessInfo;

/// A file backed mapping merged across its consecutive segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryArea {
    pub m_start: u64,
    pub mx_start: u64, // start address of executable section
    pub m_end: u64,
    pub inode: u64,
    pub path: String,
}

impl fmt::Display for MemoryArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x} {}", self.m_start, self.m_end, self.path)
    }
}

struct MapsLine<'a> {
    start: u64,
    end: u64,
    executable: bool,
    inode: u64,
    path: &'a str,
}

fn parse_line(line: &str) -> Option<MapsLine<'_>> {
    let mut segs = line.split_whitespace();
    let (start, end) = segs.next()?.split_once('-')?;
    let perms = segs.next()?;
    let _offset = segs.next()?;
    let _dev = segs.next()?;
    let inode = segs.next()?;
    let path = segs.next()?;
    // anonymous and pseudo mappings like [heap] carry no binary
    if !path.starts_with('/') {
        return None;
    }
    Some(MapsLine {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        executable: perms.contains('x'),
        inode: inode.parse().ok()?,
        path,
    })
}

/// Parse a maps file content, keeping only files with an executable segment.
pub fn parse_memory_mappings<R: BufRead>(reader: R) -> io::Result<Vec<MemoryArea>> {
    let mut areas = vec![];
    let mut last_area: Option<MemoryArea> = None;
    let mut last_executable = false;
    for line in reader.lines() {
        let line = line?;
        let Some(seg) = parse_line(&line) else {
            continue;
        };
        match last_area.as_mut() {
            Some(area) if area.path == seg.path => {
                if seg.executable && !last_executable {
                    area.mx_start = seg.start;
                    last_executable = true;
                }
                area.m_start = area.m_start.min(seg.start);
                area.m_end = area.m_end.max(seg.end);
            }
            _ => {
                if let Some(la) = last_area.take() {
                    if last_executable {
                        trace!("found {}", la);
                        areas.push(la);
                    }
                }
                last_area.replace(MemoryArea {
                    m_start: seg.start,
                    mx_start: if seg.executable { seg.start } else { 0 },
                    m_end: seg.end,
                    inode: seg.inode,
                    path: seg.path.to_owned(),
                });
                last_executable = seg.executable;
            }
        }
    }
    if let Some(la) = last_area {
        if last_executable {
            trace!("found {}", la);
            areas.push(la);
        }
    }
    Ok(areas)
}

pub fn get_memory_mappings(pid: u32) -> io::Result<Vec<MemoryArea>> {
    let path: PathBuf = ["/proc", &pid.to_string(), "maps"].iter().collect();
    trace!("read process#{pid} maps from {}", path.display());
    parse_memory_mappings(io::BufReader::new(File::open(&path)?))
}

/// Build the [`ProcessInfo`] of a live process from procfs.
pub fn discover_process(pid: u32) -> io::Result<ProcessInfo> {
    let exe: PathBuf = ["/proc", &pid.to_string(), "exe"].iter().collect();
    let exe = fs::read_link(exe)?;
    let areas = get_memory_mappings(pid)?;
    Ok(ProcessInfo::from_memory_areas(pid, &exe, &areas))
}
