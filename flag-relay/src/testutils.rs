use std::io::Write;

pub fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    write!(tmp, "{}", s).expect("write yaml");

    tmp
}
