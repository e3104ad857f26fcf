// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! INI-style configuration reader. A configuration file declares itself
//! with a first-line marker; servers load settings from `-f` files and
//! `-c section:option=value` overrides left of any `--` separator.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const CONFFILE_MARKER: &str = "#russ";

#[derive(Clone, Debug, Default)]
pub struct Conf {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

/// True when the file starts with the recognition marker.
pub fn is_conffile<P: AsRef<Path>>(path: P) -> bool {
    fs::read_to_string(path)
        .map(|text| text.lines().next() == Some(CONFFILE_MARKER))
        .unwrap_or(false)
}

impl Conf {
    pub fn new() -> Conf {
        Conf::default()
    }

    /// Parse a marked configuration file.
    pub fn read_path<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let text = fs::read_to_string(&path)?;
        let mut lines = text.lines();
        if lines.next() != Some(CONFFILE_MARKER) {
            return Err(Error::bad_args(format!(
                "not a configuration file: {}",
                path.as_ref().display()
            )));
        }
        let mut section = String::from("main");
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = name.trim().to_string();
                self.sections.entry(section.clone()).or_default();
                continue;
            }
            let Some((option, value)) = line.split_once('=') else {
                return Err(Error::bad_args(format!("bad configuration line: {line}")));
            };
            self.set(&section, option.trim(), value.trim());
        }
        Ok(())
    }

    /// Consume leading `-f <path>` and `-c sect:opt=value` arguments; a
    /// bare `opt=value` lands in section `main`. Everything from `--` on
    /// is left for the caller.
    pub fn load_args(args: &mut Vec<String>) -> Result<Conf> {
        let mut conf = Conf::new();
        while !args.is_empty() {
            match args[0].as_str() {
                "-f" => {
                    if args.len() < 2 {
                        return Err(Error::bad_args("-f requires a path"));
                    }
                    conf.read_path(&args[1])?;
                    args.drain(..2);
                }
                "-c" => {
                    if args.len() < 2 {
                        return Err(Error::bad_args("-c requires sect:opt=value"));
                    }
                    let setting = args[1].clone();
                    let (name, value) = setting
                        .split_once('=')
                        .ok_or_else(|| Error::bad_args("-c requires sect:opt=value"))?;
                    let (section, option) = match name.split_once(':') {
                        Some((s, o)) => (s, o),
                        None => ("main", name),
                    };
                    conf.set(section, option, value);
                    args.drain(..2);
                }
                "--" => {
                    args.remove(0);
                    break;
                }
                _ => break,
            }
        }
        Ok(conf)
    }

    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(option.to_string(), value.to_string());
    }

    pub fn get(&self, section: &str, option: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(option))
            .map(String::as_str)
    }

    pub fn get_or(&self, section: &str, option: &str, default: &str) -> String {
        self.get(section, option).unwrap_or(default).to_string()
    }

    pub fn get_int(&self, section: &str, option: &str, default: i64) -> i64 {
        self.get(section, option)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn get_float(&self, section: &str, option: &str, default: f64) -> f64 {
        self.get(section, option)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn has_option(&self, section: &str, option: &str) -> bool {
        self.get(section, option).is_some()
    }

    /// Section names, sorted.
    pub fn sections(&self) -> Vec<&str> {
        self.sections.keys().map(String::as_str).collect()
    }

    /// Option names within a section, sorted.
    pub fn options(&self, section: &str) -> Vec<&str> {
        self.sections
            .get(section)
            .map(|s| s.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(text: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_marker_required() {
        let f = write_conf("[main]\npath=/x\n");
        assert!(!is_conffile(f.path()));
        Conf::new().read_path(f.path()).unwrap_err();
    }

    #[test]
    fn test_parse_sections_and_types() {
        let f = write_conf("#russ\n[main]\npath = /run/svc\naccepttimeout = 30\n\n[spaths]\nfoo = +/foo\n# comment\nweight = 1.5\n");
        assert!(is_conffile(f.path()));
        let mut conf = Conf::new();
        conf.read_path(f.path()).unwrap();
        assert_eq!(conf.get("main", "path"), Some("/run/svc"));
        assert_eq!(conf.get_int("main", "accepttimeout", -1), 30);
        assert_eq!(conf.get_int("main", "missing", -1), -1);
        assert_eq!(conf.get_float("spaths", "weight", 0.0), 1.5);
        assert_eq!(conf.sections(), vec!["main", "spaths"]);
        assert_eq!(conf.options("spaths"), vec!["foo", "weight"]);
    }

    #[test]
    fn test_load_args_consumes_options() {
        let mut args: Vec<String> = ["-c", "main:path=/p", "-c", "closeonaccept=1", "--", "rest"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let conf = Conf::load_args(&mut args).unwrap();
        assert_eq!(conf.get("main", "path"), Some("/p"));
        assert_eq!(conf.get_int("main", "closeonaccept", 0), 1);
        assert_eq!(args, vec!["rest"]);
    }

    #[test]
    fn test_load_args_reads_files() {
        let f = write_conf("#russ\n[main]\nsd = 3\n");
        let mut args: Vec<String> = vec!["-f".into(), f.path().to_str().unwrap().into()];
        let conf = Conf::load_args(&mut args).unwrap();
        assert_eq!(conf.get_int("main", "sd", -1), 3);
        assert!(args.is_empty());
    }
}
