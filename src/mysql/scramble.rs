/// `mysql_native_password` scramble:
/// `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`.
pub fn scramble411(password: &[u8], seed: &[u8]) -> [u8; 20] {
    let mut sha1 = sha1_smol::Sha1::new();
    sha1.update(password);
    let pass1 = sha1.digest().bytes();
    sha1.reset();

    sha1.update(&pass1);
    let pass2 = sha1.digest().bytes();
    sha1.reset();

    sha1.update(seed);
    sha1.update(&pass2);
    let mut pass3 = sha1.digest().bytes();

    for i in 0..pass3.len() {
        pass3[i] ^= pass1[i];
    }
    pass3
}
