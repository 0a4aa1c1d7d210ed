/// Types implementing `BeanstalkSerialisable` can be written to a client as
/// one complete server -> client response.
pub trait BeanstalkSerialisable {
    /// Encodes the value in question as a Beanstalk response, including every
    /// trailing CRLF.
    fn serialise_beanstalk(&self) -> Vec<u8>;
}
