pub(crate) mod certs;
pub(crate) mod install;
pub(crate) mod probe;
