//! Fixed public keys for tests.

pub const ED25519_1: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIE9oGZvmxT29050arcJPsKjg3EwwCV3ExpfmpGrrsKx+";
pub const ED25519_2: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIMWDzf6M+vYprUBVXlvjQSXgqpHgThMEQETIhETD+rMR";
pub const ED25519_3: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIB7KSl9hB1mGcNbXChWSTwpZ+AE6GvDb66SQr98Ez/i1";
pub const ECDSA_1: &str = "ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBLa5qRCewuWN5jFH4K6cfuFScbmzQZjhAW6Qu64kZRtpIP2ziEANVCbFY1bhtq5RjNRpqCoo8auYiQaQV3kUCvI=";
pub const ECDSA_2: &str = "ecdsa-sha2-nistp256 AAAAE2VjZHNhLXNoYTItbmlzdHAyNTYAAAAIbmlzdHAyNTYAAABBBL/YnPye6UyTRFZ9Nk52dl0Xu/nKu/MYSegBsM6TWcgO6wSF8IqI0v5i9YZQrPozurdm6lKPKOvEmiFpK14pxKM=";

pub fn key(openssh: &str) -> ssh_key::PublicKey {
    ssh_key::PublicKey::from_openssh(openssh).unwrap()
}
