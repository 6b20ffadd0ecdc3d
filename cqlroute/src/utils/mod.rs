pub(crate) mod safe_format;

#[cfg(test)]
pub(crate) mod test_utils;
